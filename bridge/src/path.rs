use crate::error::{BridgeError, ErrorCode, Result};

/// One way a dotted field reference may resolve against a document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Incarnation {
    path: String,
    parent_path: String,
    array_path: String,
}

impl Incarnation {
    pub fn new(path: String, parent_path: String, array_path: String) -> Incarnation {
        Incarnation {
            path,
            parent_path,
            array_path,
        }
    }

    /// The concrete JSON path, without the leading `$.`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The nearest containing object path, or empty.
    pub fn parent_path(&self) -> &str {
        &self.parent_path
    }

    /// The nearest ancestor path expected to be an array, or empty.
    pub fn array_path(&self) -> &str {
        &self.array_path
    }

    pub fn has_parent(&self) -> bool {
        !self.parent_path.is_empty()
    }

    pub fn has_array_demand(&self) -> bool {
        !self.array_path.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Element,
    Array,
    IndexedElement,
}

/// Path parts form a DAG rooted at each segment; parts live in an arena and
/// refer to their parent by index.
#[derive(Debug)]
struct Part {
    kind: Kind,
    name: String,
    parent: Option<usize>,
}

struct Arena {
    parts: Vec<Part>,
}

impl Arena {
    fn push(&mut self, kind: Kind, name: &str, parent: Option<usize>) -> usize {
        self.parts.push(Part {
            kind,
            name: name.to_string(),
            parent,
        });
        self.parts.len() - 1
    }

    fn kind(&self, i: usize) -> Kind {
        self.parts[i].kind
    }

    fn parent(&self, i: usize) -> Option<usize> {
        self.parts[i].parent
    }

    /// The name of a part as it appears inside a longer path.
    fn name(&self, i: usize) -> String {
        let part = &self.parts[i];

        match part.kind {
            Kind::Element | Kind::Array => match part.parent {
                Some(p) => format!("{}.{}", self.path(p), part.name),
                None => part.name.clone(),
            },
            Kind::IndexedElement => match part.parent {
                Some(p) => format!("{}[{}]", self.path(p), part.name),
                None => format!("[{}]", part.name),
            },
        }
    }

    /// The JSON path of a part, with `[*]` for array parts.
    fn path(&self, i: usize) -> String {
        let part = &self.parts[i];

        match part.kind {
            Kind::Element => match part.parent {
                Some(p) => format!("{}.{}", self.path(p), part.name),
                None => part.name.clone(),
            },
            Kind::Array => match part.parent {
                Some(p) => format!("{}.{}[*]", self.path(p), part.name),
                None => format!("{}[*]", part.name),
            },
            Kind::IndexedElement => match part.parent {
                Some(p) => format!("{}[{}]", self.path(p), part.name),
                None => format!("[{}]", part.name),
            },
        }
    }
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

fn add_leaf(
    arena: &mut Arena,
    segment: &str,
    last: bool,
    numeric: bool,
    parent: Option<usize>,
    leafs: &mut Vec<usize>,
) {
    leafs.push(arena.push(Kind::Element, segment, parent));

    if !last {
        leafs.push(arena.push(Kind::Array, segment, parent));
    }

    if numeric && parent.map(|p| arena.kind(p) == Kind::Element).unwrap_or(false) {
        leafs.push(arena.push(Kind::IndexedElement, segment, parent));
    }
}

fn add_segment(arena: &mut Arena, segment: &str, last: bool, leafs: &mut Vec<usize>) {
    let numeric = is_number(segment);
    let mut next = Vec::new();

    if leafs.is_empty() {
        add_leaf(arena, segment, last, numeric, None, &mut next);
    } else {
        for &leaf in leafs.iter() {
            add_leaf(arena, segment, last, numeric, Some(leaf), &mut next);
        }
    }

    *leafs = next;
}

/// Expand a dotted key into the full set of incarnations a predicate must
/// match over.
pub fn get_incarnations(key: &str) -> Result<Vec<Incarnation>> {
    if key.is_empty() || key.split('.').any(str::is_empty) {
        return Err(BridgeError::soft(
            "FieldPath cannot be constructed with empty string",
            ErrorCode::Location40352,
        ));
    }

    let mut arena = Arena { parts: Vec::new() };
    let mut leafs = Vec::new();

    let segments: Vec<&str> = key.split('.').collect();

    for (i, segment) in segments.iter().enumerate() {
        add_segment(&mut arena, segment, i + 1 == segments.len(), &mut leafs);
    }

    let mut rval = Vec::new();

    for &leaf in &leafs {
        let path = arena.path(leaf);
        let mut parent = arena.parent(leaf);

        let parent_path = match parent {
            Some(p) => arena.name(p),
            None => String::new(),
        };

        let mut array_path = String::new();
        let mut current = Some(leaf);

        while let Some(node) = current {
            if !array_path.is_empty() {
                break;
            }

            if arena.kind(node) == Kind::IndexedElement
                || parent.map(|p| arena.kind(p) == Kind::Array).unwrap_or(false)
            {
                if let Some(p) = parent {
                    array_path = arena.name(p);
                }
            } else if arena.kind(node) == Kind::Element
                && parent
                    .map(|p| arena.kind(p) == Kind::IndexedElement)
                    .unwrap_or(false)
            {
                if let Some(gramps) = parent.and_then(|p| arena.parent(p)) {
                    array_path = arena.name(gramps);
                }
            }

            current = parent;
            parent = parent.and_then(|p| arena.parent(p));
        }

        rval.push(Incarnation::new(path, parent_path, array_path));
    }

    Ok(rval)
}

#[cfg(test)]
mod test {
    use super::*;

    fn sorted(mut v: Vec<Incarnation>) -> Vec<(String, String, String)> {
        v.sort();
        v.into_iter()
            .map(|i| {
                (
                    i.path().to_string(),
                    i.parent_path().to_string(),
                    i.array_path().to_string(),
                )
            })
            .collect()
    }

    fn expect(key: &str, expected: &[(&str, &str, &str)]) {
        let mut expected: Vec<(String, String, String)> = expected
            .iter()
            .map(|(a, b, c)| (a.to_string(), b.to_string(), c.to_string()))
            .collect();
        expected.sort();

        assert_eq!(sorted(get_incarnations(key).unwrap()), expected, "key {}", key);
    }

    #[test]
    fn plain_key() {
        expect("a", &[("a", "", "")]);
    }

    #[test]
    fn one_dot() {
        expect("a.b", &[("a.b", "a", ""), ("a[*].b", "a", "a")]);
    }

    #[test]
    fn two_dots() {
        expect(
            "a.b.c",
            &[
                ("a.b.c", "a.b", ""),
                ("a[*].b.c", "a[*].b", "a"),
                ("a.b[*].c", "a.b", "a.b"),
                ("a[*].b[*].c", "a[*].b", "a[*].b"),
            ],
        );
    }

    #[test]
    fn numeric_middle_segment() {
        expect(
            "a.1.b",
            &[
                ("a.1.b", "a.1", ""),
                ("a[1].b", "a[1]", "a"),
                ("a[*].1.b", "a[*].1", "a"),
                ("a.1[*].b", "a.1", "a.1"),
                ("a[*].1[*].b", "a[*].1", "a[*].1"),
            ],
        );
    }

    #[test]
    fn numeric_last_segment() {
        expect(
            "a.1",
            &[("a.1", "a", ""), ("a[1]", "a", "a"), ("a[*].1", "a", "a")],
        );
    }

    #[test]
    fn paths_are_pairwise_distinct() {
        let incarnations = get_incarnations("x.y.z.w").unwrap();
        let mut paths: Vec<&str> = incarnations.iter().map(|i| i.path()).collect();
        let total = paths.len();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), total);
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(get_incarnations("").is_err());
        assert!(get_incarnations("a..b").is_err());
        assert!(get_incarnations(".a").is_err());
    }
}
