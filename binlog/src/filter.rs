use regex::Regex;

/// Include/exclude filter over fully qualified `db.table` identifiers.
#[derive(Debug, Default, Clone)]
pub struct TableFilter {
    match_re: Option<Regex>,
    exclude: Option<Regex>,
}

impl TableFilter {
    pub fn new(match_re: Option<Regex>, exclude: Option<Regex>) -> TableFilter {
        TableFilter { match_re, exclude }
    }

    pub fn matches(&self, ident: &str) -> bool {
        if let Some(m) = &self.match_re {
            if !m.is_match(ident) {
                return false;
            }
        }

        if let Some(e) = &self.exclude {
            if e.is_match(ident) {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn re(s: &str) -> Option<Regex> {
        Some(Regex::new(s).unwrap())
    }

    #[test]
    fn no_patterns_match_everything() {
        assert!(TableFilter::default().matches("any.table"));
    }

    #[test]
    fn include_only() {
        let f = TableFilter::new(re("^test\\."), None);
        assert!(f.matches("test.t1"));
        assert!(!f.matches("mysql.user"));
    }

    #[test]
    fn exclude_only() {
        let f = TableFilter::new(None, re("\\.secret$"));
        assert!(f.matches("db.t1"));
        assert!(!f.matches("db.secret"));
    }

    #[test]
    fn include_and_exclude() {
        let f = TableFilter::new(re("^app\\."), re("_tmp$"));
        assert!(f.matches("app.orders"));
        assert!(!f.matches("app.orders_tmp"));
        assert!(!f.matches("other.orders"));
    }
}
