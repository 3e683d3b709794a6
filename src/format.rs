//! Re-indents rendered SQL for logs and the CLI. Cosmetic only: the output
//! differs from the input in whitespace alone.

const CLAUSES: [&str; 12] = [
    "WITH ",
    "SELECT ",
    "FROM ",
    "LEFT JOIN ",
    "INNER JOIN ",
    "JOIN ",
    "WHERE ",
    "GROUP BY ",
    "HAVING ",
    "ORDER BY ",
    "LIMIT ",
    "OFFSET ",
];

const INDENT: &str = "    ";

/// Starts every top-level clause on its own line, indented by sub-query
/// depth. Quoted identifiers, string constants and `{name:Type}`
/// placeholders are copied verbatim.
pub fn format_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + sql.len() / 8);
    let mut rest = sql;
    let mut depth = 0usize;
    let mut closer: Option<char> = None;
    let mut prev: Option<char> = None;

    while let Some(c) = rest.chars().next() {
        if closer.is_none() && matches!(prev, None | Some(' ') | Some('(')) {
            if let Some(clause) = CLAUSES.iter().find(|clause| rest.starts_with(*clause)) {
                while out.ends_with(' ') {
                    out.pop();
                }
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(&INDENT.repeat(depth));
                out.push_str(clause);
                rest = &rest[clause.len()..];
                prev = Some(' ');
                continue;
            }
        }

        match closer {
            Some(end) if c == end => closer = None,
            Some(_) => {}
            None => match c {
                '\'' => closer = Some('\''),
                '"' => closer = Some('"'),
                '{' => closer = Some('}'),
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                _ => {}
            },
        }
        out.push(c);
        prev = Some(c);
        rest = &rest[c.len_utf8()..];
    }
    out
}
