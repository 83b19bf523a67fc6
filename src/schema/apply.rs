//! Dump-script statement splitting.
//!
//! Dumps use `;` as the statement terminator, except stored-program bodies
//! (functions, procedures, triggers, events) which are wrapped in
//! `DELIMITER ;;` ... `DELIMITER ;` blocks so the `;` inside the body does
//! not terminate the statement.

/// Split a dump script into executable statements, honoring `DELIMITER`
/// directives. Comment-only chunks are dropped; leading comment lines stay
/// attached to their statement.
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut delimiter = ";".to_string();
    let mut current = String::new();

    for line in script.lines() {
        let trimmed = line.trim();

        if let Some(rest) = directive(trimmed, "DELIMITER") {
            flush(&mut current, &mut statements);
            delimiter = rest.to_string();
            continue;
        }

        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);

        let accumulated = current.trim_end();
        if accumulated.ends_with(delimiter.as_str()) {
            let stmt = accumulated[..accumulated.len() - delimiter.len()].to_string();
            current = stmt;
            flush(&mut current, &mut statements);
        }
    }

    flush(&mut current, &mut statements);
    statements
}

fn directive<'a>(line: &'a str, keyword: &str) -> Option<&'a str> {
    let upper = line.to_ascii_uppercase();
    if upper.starts_with(keyword) {
        let rest = line[keyword.len()..].trim();
        if !rest.is_empty() {
            return Some(rest);
        }
    }
    None
}

fn flush(current: &mut String, statements: &mut Vec<String>) {
    let stmt = current.trim();
    if !stmt.is_empty() && !is_comment_only(stmt) {
        statements.push(stmt.to_string());
    }
    current.clear();
}

fn is_comment_only(chunk: &str) -> bool {
    chunk
        .lines()
        .all(|l| l.trim().is_empty() || l.trim().starts_with("--"))
}

/// Best-effort extraction of the line number from a server syntax-error
/// message of the form "... at line N".
pub fn syntax_error_line(message: &str) -> u32 {
    message
        .rsplit("at line ")
        .next()
        .and_then(|tail| {
            tail.split(|c: char| !c.is_ascii_digit())
                .next()
                .and_then(|d| d.parse().ok())
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_plain_statements() {
        let script = "CREATE TABLE a (id INT);\n\nINSERT INTO a VALUES (1);\n";
        let stmts = split_statements(script);
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0], "CREATE TABLE a (id INT)");
        assert_eq!(stmts[1], "INSERT INTO a VALUES (1)");
    }

    #[test]
    fn keeps_leading_comments_attached() {
        let script = "-- Create a table\nCREATE TABLE a (id INT);\n";
        let stmts = split_statements(script);
        assert_eq!(stmts.len(), 1);
        assert!(stmts[0].starts_with("-- Create a table"));
    }

    #[test]
    fn drops_comment_only_chunks() {
        let script = "-- Just a note\n\n-- Another note\n";
        assert!(split_statements(script).is_empty());
    }

    #[test]
    fn honors_delimiter_blocks() {
        let script = "\
-- Create total Function
DELIMITER ;;
CREATE FUNCTION total(x INT) RETURNS INT
BEGIN
  RETURN x + 1;
END;;
DELIMITER ;

SELECT 1;
";
        let stmts = split_statements(script);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].contains("RETURN x + 1;"));
        assert!(stmts[0].ends_with("END"));
        assert_eq!(stmts[1], "SELECT 1");
    }

    #[test]
    fn multiline_insert_splits_at_terminator() {
        let script = "\
INSERT INTO `employees` VALUES
\t(1, 'Ada', 1),
\t(2, 'Grace', 2);
INSERT INTO `projects` VALUES
\t(1, 'apollo');
";
        let stmts = split_statements(script);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].contains("'Grace'"));
        assert!(stmts[1].contains("'apollo'"));
    }

    #[test]
    fn unterminated_tail_is_kept() {
        let stmts = split_statements("SELECT 1");
        assert_eq!(stmts, vec!["SELECT 1"]);
    }

    #[test]
    fn parses_error_line() {
        assert_eq!(
            syntax_error_line("You have an error in your SQL syntax; ... at line 3"),
            3
        );
        assert_eq!(syntax_error_line("no line info"), 0);
    }
}
