//! Small helpers shared across the crate.

use std::borrow::Cow;
use uuid::Uuid;

/// Find where a flag or assignment value ends: the first unquoted whitespace.
fn find_value_end(s: &str) -> usize {
    let mut end = 0;
    let mut in_quote = None;
    let mut escaped = false;

    for c in s.chars() {
        let len = c.len_utf8();
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if let Some(q) = in_quote {
            if c == q {
                in_quote = None;
            }
        } else if c == '"' || c == '\'' {
            in_quote = Some(c);
        } else if c.is_whitespace() {
            break;
        }
        end += len;
    }
    end
}

/// Mask credentials in a remote command before it reaches the logs.
///
/// Covers the password flags used by the appliance console CLI and `psql`
/// plus the usual `PASSWORD=` style assignments.
pub fn mask_sensitive_command(cmd: &str) -> String {
    const PATTERNS: &[&str] = &[
        "PGPASSWORD=",
        "PASSWORD=",
        "TOKEN=",
        "--password ",
        "--password=",
        "--sshpassword ",
        "--ipapassword ",
        "--dbpassword ",
        " -p ",
        " -a ",
    ];

    let mut result = cmd.to_string();
    for pattern in PATTERNS {
        let mut search_start = 0;
        while search_start < result.len() {
            let Some(found) = result[search_start..].find(pattern) else {
                break;
            };
            let abs_start = search_start + found;
            let value_start = abs_start + pattern.len();
            let value_end = value_start + find_value_end(&result[value_start..]);
            if value_end == value_start {
                search_start = value_start;
                continue;
            }
            result.replace_range(value_start..value_end, "***");
            search_start = value_start + 3;
        }
    }
    result
}

/// Quote a value for a POSIX shell command line.
pub fn shell_quote(value: &str) -> String {
    shell_escape::unix::escape(Cow::Borrowed(value)).into_owned()
}

/// Escape a value for use inside a single-quoted Ruby string.
pub fn ruby_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// A single-quoted SQL string literal.
pub fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// A double-quoted SQL identifier.
pub fn sql_identifier(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// A fresh path under `/tmp` for a generated remote file.
pub fn random_remote_path(extension: &str) -> String {
    let name = Uuid::new_v4().simple().to_string();
    if extension.is_empty() {
        format!("/tmp/{name}")
    } else {
        format!("/tmp/{name}.{extension}")
    }
}

/// Substitute `{{key}}` placeholders in a script template.
pub fn render_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in values {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}

/// Keep at most `max` trailing bytes of captured output, on a char boundary.
pub fn tail(output: &str, max: usize) -> &str {
    if output.len() <= max {
        return output;
    }
    let mut start = output.len() - max;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    &output[start..]
}
