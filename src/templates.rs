//! HTML served by the HTTP adapter.
//!
//! The page is deliberately plain: one form whose field names are exactly
//! [`crate::pipeline::validate::REQUIRED_FIELDS`] plus the optional photo
//! input. Keeping the markup here, next to a test that checks it against
//! the validator, stops the two from drifting apart.

use crate::server::flash::{FlashKind, FlashMessage};

/// Multipart field carrying the optional photo.
pub const PHOTO_FIELD: &str = "orphan_photo";

/// `(form key, label, input type)` in display order.
const FORM_FIELDS: &[(&str, &str, &str)] = &[
    ("child_name", "Child's name", "text"),
    ("guardian_name", "Guardian's name", "text"),
    ("birthday", "Date of birth", "date"),
    ("child_id", "Child ID", "text"),
    ("child_phone", "Guardian phone", "tel"),
    ("location", "Location", "text"),
    ("donor_name", "Sponsor's name", "text"),
    ("donor_phone", "Sponsor phone", "tel"),
    ("address", "Sponsor address", "text"),
    ("month", "Start month", "month"),
    ("amount", "Monthly amount", "text"),
];

const PAGE_HEAD: &str = r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Sponsorship certificate</title>
<style>
body { font-family: system-ui, sans-serif; max-width: 40rem; margin: 2rem auto; padding: 0 1rem; }
label { display: block; margin-top: .75rem; font-weight: 600; }
input { width: 100%; padding: .4rem; box-sizing: border-box; }
button { margin-top: 1.25rem; padding: .6rem 1.2rem; }
.flash { padding: .75rem; border-radius: .25rem; margin-bottom: 1rem; }
.flash-success { background: #e6f4ea; color: #1e4620; }
.flash-error { background: #fdecea; color: #611a15; }
</style>
</head>
<body>
<h1>Sponsorship certificate</h1>
"#;

const PAGE_TAIL: &str = "</body>\n</html>\n";

/// Escape text for inclusion in HTML element content or a quoted attribute.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// The form page, with an optional flash banner above the form.
pub fn render_form_page(flash: Option<&FlashMessage>) -> String {
    let mut html = String::from(PAGE_HEAD);
    if let Some(msg) = flash {
        let class = match msg.kind {
            FlashKind::Success => "flash flash-success",
            FlashKind::Error => "flash flash-error",
        };
        html.push_str(&format!(
            "<div class=\"{class}\" role=\"status\">{}</div>\n",
            escape_html(&msg.text)
        ));
    }

    html.push_str(r#"<form method="post" action="/submit" enctype="multipart/form-data">"#);
    html.push('\n');
    for (key, label, kind) in FORM_FIELDS {
        html.push_str(&format!(
            "<label for=\"{key}\">{label}</label>\n<input id=\"{key}\" name=\"{key}\" type=\"{kind}\">\n"
        ));
    }
    html.push_str(&format!(
        "<label for=\"{PHOTO_FIELD}\">Photo (PNG, JPG or GIF)</label>\n\
         <input id=\"{PHOTO_FIELD}\" name=\"{PHOTO_FIELD}\" type=\"file\" accept=\".png,.jpg,.jpeg,.gif\">\n"
    ));
    html.push_str("<button type=\"submit\">Generate certificate</button>\n</form>\n");
    html.push_str(PAGE_TAIL);
    html
}
