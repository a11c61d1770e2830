//! SQL statement classification.
//!
//! Used where a driver must be told up front whether to stream a result set
//! or collect an affected-row count.

/// Keywords that start a data modification statement.
const MODIFICATION_KEYWORDS: [&str; 5] = ["INSERT", "UPDATE", "DELETE", "MERGE", "REPLACE"];

/// Keywords that start a definition or permission statement.
const DEFINITION_KEYWORDS: [&str; 7] = [
    "CREATE", "ALTER", "DROP", "TRUNCATE", "GRANT", "REVOKE", "RENAME",
];

/// Clauses that make a modification statement return rows.
const OUTPUT_CLAUSES: [&str; 2] = ["RETURNING", "OUTPUT"];

/// Classifies SQL statements by their keywords.
pub struct SqlClassifier;

impl SqlClassifier {
    /// Returns the first keyword, upper-cased, skipping whitespace, comments and `(`.
    pub fn leading_keyword(sql: &str) -> Option<String> {
        let body = strip_leading_noise(sql);
        let keyword: String = body
            .chars()
            .take_while(|c| c.is_ascii_alphabetic() || *c == '_')
            .collect();
        (!keyword.is_empty()).then(|| keyword.to_ascii_uppercase())
    }

    /// Checks if the SQL is a modification statement (INSERT/UPDATE/DELETE/...).
    pub fn is_modification(sql: &str) -> bool {
        Self::leading_keyword(sql)
            .map(|keyword| MODIFICATION_KEYWORDS.contains(&keyword.as_str()))
            .unwrap_or(false)
    }

    /// Checks for a `RETURNING` or `OUTPUT` clause outside literals and comments.
    pub fn has_output_clause(sql: &str) -> bool {
        code_words(sql)
            .iter()
            .any(|word| OUTPUT_CLAUSES.iter().any(|clause| word.eq_ignore_ascii_case(clause)))
    }

    /// Checks if the statement can only report a row count: a modification
    /// without an output clause, or a definition statement.
    ///
    /// Anything else (queries, procedure calls, batches) may produce rows.
    pub fn is_row_count_only(sql: &str) -> bool {
        if Self::is_modification(sql) {
            return !Self::has_output_clause(sql);
        }
        Self::leading_keyword(sql)
            .is_some_and(|keyword| DEFINITION_KEYWORDS.contains(&keyword.as_str()))
    }
}

fn strip_leading_noise(sql: &str) -> &str {
    let mut rest = sql;
    loop {
        let trimmed = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
        if let Some(after) = trimmed.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        } else if let Some(after) = trimmed.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, tail)| tail).unwrap_or("");
        } else {
            return trimmed;
        }
    }
}

/// Bare words of `sql`, skipping string literals, quoted identifiers and comments.
fn code_words(sql: &str) -> Vec<&str> {
    let bytes = sql.as_bytes();
    let mut words = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"' | b'`' | b'[') => {
                let close = if quote == b'[' { b']' } else { quote };
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == close {
                        // Doubled delimiter is an escape.
                        if bytes.get(i + 1) == Some(&close) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                    i += 1;
                }
                i += 2;
            }
            c if c.is_ascii_alphanumeric() || c == b'_' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                words.push(&sql[start..i]);
            }
            _ => i += 1,
        }
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comments_are_skipped() {
        let sql = "-- monthly report\n/* owner: finance */ SELECT 1";
        assert_eq!(SqlClassifier::leading_keyword(sql).as_deref(), Some("SELECT"));
        assert_eq!(
            SqlClassifier::leading_keyword("(SELECT 1) UNION (SELECT 2)").as_deref(),
            Some("SELECT")
        );
    }

    #[test]
    fn test_modifications() {
        assert!(SqlClassifier::is_modification("update users set name = 'b'"));
        assert!(SqlClassifier::is_row_count_only("INSERT INTO users (name) VALUES ('a')"));
        assert!(!SqlClassifier::is_modification("SELECT * FROM users"));
    }

    #[test]
    fn test_output_clause_inside_literal_is_ignored() {
        assert!(SqlClassifier::is_row_count_only(
            "UPDATE customers SET note = 'returning customer' WHERE id = 1"
        ));
        assert!(SqlClassifier::is_row_count_only(
            "UPDATE customers SET returning_customer = 1 -- returning\nWHERE id = 1"
        ));
        assert!(!SqlClassifier::is_row_count_only(
            "INSERT INTO users (name) VALUES ('a') RETURNING id"
        ));
        assert!(!SqlClassifier::is_row_count_only(
            "DELETE FROM users OUTPUT deleted.id WHERE id = 1"
        ));
        assert!(!SqlClassifier::has_output_clause("SELECT [output] FROM t"));
    }

    #[test]
    fn test_batches_and_procedures_may_return_rows() {
        for sql in [
            "SELECT 1",
            "CALL monthly_report()",
            "EXEC sp_who",
            "SET NOCOUNT ON; SELECT 1 AS x",
            "DECLARE @n int = 1; SELECT @n",
            "WITH t AS (SELECT 1) SELECT * FROM t",
        ] {
            assert!(!SqlClassifier::is_row_count_only(sql), "{sql}");
        }
    }

    #[test]
    fn test_definitions_report_counts() {
        assert!(SqlClassifier::is_row_count_only("CREATE TABLE t (id int)"));
        assert!(SqlClassifier::is_row_count_only("  drop table t"));
    }

    #[test]
    fn test_empty_statement() {
        assert_eq!(SqlClassifier::leading_keyword("   -- nothing"), None);
        assert!(!SqlClassifier::is_row_count_only(""));
    }
}
