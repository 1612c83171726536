//! 首页：渲染文件列表与删除表单。

use axum::extract::Extension;
use axum::response::Html;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

use crate::error::ApiError;
use crate::files::sorted_listing;
use crate::storage::{Storage, StoredFile, format_modified};

/// 首页处理器。
pub async fn index(Extension(storage): Extension<Arc<Storage>>) -> Result<Html<String>, ApiError> {
    let files = sorted_listing(&storage).await?;
    debug!(count = files.len(), "render index");
    Ok(Html(render_index(&files)))
}

fn render_index(files: &[StoredFile]) -> String {
    let mut rows = String::new();
    for file in files {
        let name = escape_html(&file.name);
        let _ = write!(
            rows,
            "<tr><td><a href=\"/files/{name}\">{name}</a></td><td>{size}</td><td>{modified}</td>\
             <td><form method=\"post\" action=\"/delete/{name}\"><button type=\"submit\">Delete</button></form></td></tr>\n",
            size = file.size,
            modified = format_modified(file.modified.as_ref()),
        );
    }
    if files.is_empty() {
        rows.push_str("<tr><td colspan=\"4\">No files uploaded yet.</td></tr>\n");
    }

    format!(
        "<!doctype html>\n<html>\n<head><meta charset=\"utf-8\"><title>Uploaded files</title></head>\n<body>\n\
         <h1>Uploaded files</h1>\n\
         <table>\n<tr><th>Name</th><th>Size (bytes)</th><th>Modified (UTC)</th><th></th></tr>\n{rows}</table>\n\
         <form method=\"post\" action=\"/delete_all\"><button type=\"submit\">Delete all</button></form>\n\
         </body>\n</html>\n"
    )
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_rows_with_links() {
        let files = vec![StoredFile {
            name: "1700000000_a.txt".into(),
            size: 12,
            modified: None,
        }];
        let html = render_index(&files);
        assert!(html.contains("href=\"/files/1700000000_a.txt\""));
        assert!(html.contains("action=\"/delete/1700000000_a.txt\""));
        assert!(html.contains("<td>12</td>"));
    }

    #[test]
    fn escapes_names() {
        assert_eq!(escape_html("<a href='x'>&"), "&lt;a href=&#39;x&#39;&gt;&amp;");
    }

    #[test]
    fn empty_listing_has_placeholder() {
        assert!(render_index(&[]).contains("No files uploaded yet."));
    }
}
