//! Response model: one host's reply to a command, and rendering.

use serde::{Deserialize, Serialize};

/// One host's reply to a command.
///
/// A handler fills in free text, an error, or a table; the `data` field
/// carries machine-readable payloads for callers that want more than the
/// rendered form. `suggest` is only populated by completion requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    /// Host that produced this response.
    pub host: String,
    /// Free-text reply.
    #[serde(default)]
    pub response: String,
    /// Error text; `None` on success.
    #[serde(default)]
    pub error: Option<String>,
    /// Column names for `tabular`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header: Vec<String>,
    /// Table rows; each row has one cell per header column.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tabular: Vec<Vec<String>>,
    /// Opaque machine-readable payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Completion candidates (suggest requests only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggest: Vec<String>,
}

/// A set of responses produced by one command, keyed by host.
pub type Responses = Vec<Response>;

impl Response {
    /// A plain-text success response.
    pub fn new(host: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            response: text.into(),
            ..Default::default()
        }
    }

    /// An error response.
    pub fn error(host: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// A tabular response.
    pub fn table(host: impl Into<String>, header: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self {
            host: host.into(),
            header,
            tabular: rows,
            ..Default::default()
        }
    }
}

/// Render a batch of responses into the text a frontend prints.
///
/// Tabular responses from all hosts are merged into a single aligned table;
/// a `host` column is prepended when more than one host contributed. Errors
/// render on their own lines after the successful output.
pub fn render(responses: &[Response]) -> String {
    let hosts: std::collections::HashSet<&str> =
        responses.iter().map(|r| r.host.as_str()).collect();
    let multi_host = hosts.len() > 1;

    let mut out = String::new();

    let tabular: Vec<&Response> = responses.iter().filter(|r| !r.tabular.is_empty()).collect();
    if let Some(first) = tabular.first() {
        let mut header = Vec::new();
        if multi_host {
            header.push("host".to_string());
        }
        header.extend(first.header.iter().cloned());

        let mut rows = Vec::new();
        for resp in &tabular {
            for row in &resp.tabular {
                let mut cells = Vec::new();
                if multi_host {
                    cells.push(resp.host.clone());
                }
                cells.extend(row.iter().cloned());
                rows.push(cells);
            }
        }
        out.push_str(&render_table(&header, &rows));
    }

    for resp in responses {
        if resp.tabular.is_empty() && !resp.response.is_empty() {
            if multi_host {
                out.push_str(&format!("[{}] {}\n", resp.host, resp.response));
            } else {
                out.push_str(&resp.response);
                if !resp.response.ends_with('\n') {
                    out.push('\n');
                }
            }
        }
    }

    for resp in responses {
        if let Some(err) = &resp.error {
            out.push_str(&format!("[{}] E: {}\n", resp.host, err));
        }
    }

    out
}

fn render_table(header: &[String], rows: &[Vec<String>]) -> String {
    let columns = header.len();
    let mut widths: Vec<usize> = header.iter().map(String::len).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate().take(columns) {
            if cell.len() > widths[i] {
                widths[i] = cell.len();
            }
        }
    }

    let mut out = String::new();
    let fmt_row = |cells: &[String], widths: &[usize]| -> String {
        let padded: Vec<String> = cells
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{:width$}", c, width = widths.get(i).copied().unwrap_or(0)))
            .collect();
        let mut line = padded.join(" | ");
        while line.ends_with(' ') {
            line.pop();
        }
        line.push('\n');
        line
    };

    out.push_str(&fmt_row(header, &widths));
    let divider: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    out.push_str(&format!("{}\n", divider.join("-+-")));
    for row in rows {
        out.push_str(&fmt_row(row, &widths));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_single_host_text() {
        let rendered = render(&[Response::new("n0", "hello world")]);
        assert_eq!(rendered, "hello world\n");
    }

    #[test]
    fn render_multi_host_prefixes() {
        let rendered = render(&[Response::new("n0", "a"), Response::new("n1", "b")]);
        assert!(rendered.contains("[n0] a"));
        assert!(rendered.contains("[n1] b"));
    }

    #[test]
    fn render_table_aligns_and_merges_hosts() {
        let header = vec!["id".to_string(), "name".to_string()];
        let rendered = render(&[
            Response::table("n0", header.clone(), vec![vec!["1".into(), "a".into()]]),
            Response::table("n1", header, vec![vec!["2".into(), "long-name".into()]]),
        ]);
        let mut lines = rendered.lines();
        assert_eq!(lines.next().unwrap().trim_end(), "host | id | name");
        assert!(rendered.contains("n1   | 2  | long-name"));
    }

    #[test]
    fn render_errors_follow_output() {
        let rendered = render(&[
            Response::new("n0", "fine"),
            Response::error("n1", "meshage timeout: vm info"),
        ]);
        assert!(rendered.ends_with("[n1] E: meshage timeout: vm info\n"));
    }

    #[test]
    fn serde_skips_empty_fields() {
        let json = serde_json::to_string(&Response::new("n0", "x")).unwrap();
        assert!(!json.contains("tabular"));
        assert!(!json.contains("suggest"));
    }
}
