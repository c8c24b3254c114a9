use std::{borrow::Cow, fmt, fmt::Write, fs, io, path::Path};

/// The default maximum number of rows displayed.
pub const DEFAULT_MAX_ROWS: usize = 100;

/// Converts a not found error to Ok(false)
pub fn path_exists(path: &Path) -> io::Result<bool> {
    match fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Parse a numeric CSV field, mapping "", "null" and "NaN" to `None`.
pub fn optional_f64(s: &str) -> Result<Option<f64>, std::num::ParseFloatError> {
    let s = s.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("null") || s.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    let v: f64 = s.parse()?;
    Ok(if v.is_finite() { Some(v) } else { None })
}

/// Format an optional number for display, leaving missing values blank.
pub fn fmt_opt(v: Option<f64>) -> String {
    match v {
        Some(v) => format!("{:.3}", v),
        None => String::new(),
    }
}

/// Something to make it easier to get tables on screen in evcxr.
///
/// Long tables show the first and last `max_rows / 2` rows.
pub struct HtmlTable {
    headers: Vec<Cow<'static, str>>,
    title: Option<Cow<'static, str>>,
    rows: Vec<Vec<String>>,
    max_rows: usize,
}

impl HtmlTable {
    pub fn new(headers: impl IntoIterator<Item = impl Into<Cow<'static, str>>>) -> Self {
        HtmlTable {
            headers: headers.into_iter().map(Into::into).collect(),
            title: None,
            rows: vec![],
            max_rows: DEFAULT_MAX_ROWS,
        }
    }

    pub fn with_title(mut self, title: impl Into<Cow<'static, str>>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Set the maximum number of rows to show (`0` shows everything).
    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        // keep it even so both halves are the same size
        self.max_rows = max_rows + max_rows % 2;
        self
    }

    pub fn push_row<D: fmt::Display>(&mut self, cells: impl IntoIterator<Item = D>) {
        self.rows
            .push(cells.into_iter().map(|c| c.to_string()).collect());
    }

    pub fn to_html(&self) -> String {
        let mut output = String::new();
        if let Some(title) = &self.title {
            output.push_str(r#"<p style="font-weight:bold;font-variant:small-caps;">"#);
            html_escape::encode_text_to_string(title, &mut output);
            output.push_str("</p>");
        }
        output.push_str("<table><thead><tr><th></th>");
        for header in &self.headers {
            output.push_str("<th>");
            html_escape::encode_text_to_string(header, &mut output);
            output.push_str("</th>");
        }
        output.push_str("</tr></thead><tbody>");

        let len = self.rows.len();
        if self.max_rows == 0 || self.max_rows >= len {
            self.write_rows(0..len, &mut output);
        } else {
            let half = self.max_rows / 2;
            self.write_rows(0..half, &mut output);
            output.push_str("<tr><th>...</th>");
            for _ in 0..self.headers.len() {
                output.push_str("<td>...</td>");
            }
            output.push_str("</tr>");
            self.write_rows(len - half..len, &mut output);
        }
        output.push_str("</tbody></table>");
        output
    }

    /// Display this table as HTML in the evcxr window.
    pub fn evcxr_display(&self) {
        println!(
            "EVCXR_BEGIN_CONTENT text/html\n{}\nEVCXR_END_CONTENT",
            self.to_html()
        );
    }

    fn write_rows(&self, idxs: std::ops::Range<usize>, output: &mut String) {
        for idx in idxs {
            let _ = write!(output, "<tr><th>{}</th>", idx);
            for cell in &self.rows[idx] {
                output.push_str("<td>");
                html_escape::encode_text_to_string(cell, output);
                output.push_str("</td>");
            }
            output.push_str("</tr>");
        }
    }
}

pub fn header(header: &str) {
    let len = header.len();
    print!("\n{}\n", header);
    for _ in 0..len {
        print!("=");
    }
    println!("\n")
}
