// src/templates.rs
//
// Cosmetic HTML bodies. Kept apart from the response model so the wire
// logic stays free of markup strings.

/// Error page shown for every generated failure status.
pub fn error_page(code: u16, reason: &str, message: &str) -> String {
    let mut body = String::with_capacity(256);
    body.push_str("<!DOCTYPE html><html><head><title>Error ");
    body.push_str(&code.to_string());
    body.push_str("</title></head><body>");
    body.push_str("<h1>Error ");
    body.push_str(&code.to_string());
    body.push(' ');
    body.push_str(reason);
    body.push_str("</h1>");
    if !message.is_empty() {
        body.push_str("<p>");
        body.push_str(message);
        body.push_str("</p>");
    }
    body.push_str("</body></html>");
    body
}

/// Small confirmation page for PUT/DELETE/upload results.
pub fn message_page(title: &str, message: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><title>{}</title></head><body><h1>{}</h1><p>{}</p></body></html>",
        title, title, message
    )
}

/// Directory listing. `entries` are (display name, is_directory) pairs,
/// already sorted; directories get a trailing slash.
pub fn directory_listing(uri: &str, entries: &[(String, bool)]) -> String {
    let mut body = String::with_capacity(512);
    body.push_str("<!DOCTYPE html><html><head><title>Directory listing for ");
    body.push_str(uri);
    body.push_str("</title>");
    body.push_str(
        "<style>body{font-family:Arial,sans-serif;margin:40px;}h1{color:#333;}ul{list-style:none;}</style>",
    );
    body.push_str("</head><body><h1>Directory listing for ");
    body.push_str(uri);
    body.push_str("</h1><ul>");
    if uri != "/" {
        body.push_str("<li><a href=\"../\">../</a></li>");
    }
    for (name, is_dir) in entries {
        let display = if *is_dir {
            format!("{}/", name)
        } else {
            name.clone()
        };
        body.push_str("<li><a href=\"");
        body.push_str(&display);
        body.push_str("\">");
        body.push_str(&display);
        body.push_str("</a></li>");
    }
    body.push_str("</ul></body></html>");
    body
}
