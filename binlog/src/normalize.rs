/// SQL statement normalization applied before DDL parsing.
///
/// Comments are removed, except executable comments (`/*!NNNNN ... */` and
/// `/*M!NNNNN ... */`) which have their header stripped so the statement
/// inside them is parsed. Backtick-quoted sections are left untouched.
/// All whitespace collapses to plain spaces.
pub fn normalize_sql(sql: &str) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];

        if c == b'`' {
            // Copy the quoted section verbatim.
            let start = i;
            i += 1;
            while i < bytes.len() && bytes[i] != b'`' {
                i += 1;
            }
            if i < bytes.len() {
                i += 1;
            }
            out.push_str(&sql[start..i]);
        } else if c == b'/' && i + 1 < bytes.len() && bytes[i + 1] == b'*' {
            let executable = sql[i..].starts_with("/*!") || sql[i..].starts_with("/*M!");

            if executable {
                // Keep the body, drop the comment header.
                i += if sql[i..].starts_with("/*M!") { 4 } else { 3 };

                // Skip the version part.
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
            } else {
                // Plain comment, skip to the terminator.
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
            }
        } else if c == b'#' || (c == b'-' && sql[i..].starts_with("-- ")) {
            // Line comment, skip to end of line.
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
        } else if c.is_ascii_whitespace() {
            out.push(' ');
            i += 1;
        } else {
            out.push(c as char);
            i += 1;
        }
    }

    // Collapse runs of spaces produced by comment removal.
    let mut collapsed = String::with_capacity(out.len());
    let mut last_space = false;
    for ch in out.chars() {
        if ch == ' ' {
            if !last_space {
                collapsed.push(' ');
            }
            last_space = true;
        } else {
            collapsed.push(ch);
            last_space = false;
        }
    }

    let mut rval = collapsed.trim().to_string();

    // A trailing `*/` remains when the whole statement was wrapped in an
    // executable comment.
    if let Some(stripped) = rval.strip_suffix("*/") {
        rval = stripped.trim_end().to_string();
    }

    rval
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn whitespace_is_unified() {
        assert_eq!(
            normalize_sql("CREATE\tTABLE\n t1   (a INT)"),
            "CREATE TABLE t1 (a INT)"
        );
    }

    #[test]
    fn comments_are_removed() {
        assert_eq!(
            normalize_sql("ALTER /* online */ TABLE t1 -- trailing\n ADD a INT # more"),
            "ALTER TABLE t1 ADD a INT"
        );
    }

    #[test]
    fn executable_comment_header_is_stripped() {
        assert_eq!(
            normalize_sql("/*!100301 ALTER TABLE t1 ADD a INT */"),
            "ALTER TABLE t1 ADD a INT"
        );
        assert_eq!(
            normalize_sql("/*M!100301 ALTER TABLE t1 ADD a INT */"),
            "ALTER TABLE t1 ADD a INT"
        );
    }

    #[test]
    fn backticks_protect_content() {
        assert_eq!(
            normalize_sql("ALTER TABLE `a -- b` ADD `c # d` INT"),
            "ALTER TABLE `a -- b` ADD `c # d` INT"
        );
    }
}
