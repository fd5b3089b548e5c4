//! 目录列表页面渲染。

use std::fmt::{self, Write};

use crate::sort::{SortDirection, SortKey};
use crate::storage::FileEntry;

/// 单次目录列表请求的渲染上下文。
#[derive(Debug)]
pub struct ListingContext {
    pub url_path: String,
    pub is_root: bool,
    pub upload_enabled: bool,
    pub sort_key: SortKey,
    pub direction: SortDirection,
    pub entries: Vec<FileEntry>,
}

const STYLE: &str = "body{font-family:monospace;margin:2em}\
table{border-collapse:collapse}\
th,td{padding:0 1em 0 0;text-align:left}\
td.size{text-align:right}\
form{margin-bottom:1em}";

/// 将上下文渲染为 HTML 页面。
pub fn render(ctx: &ListingContext) -> Result<String, fmt::Error> {
    let mut out = String::new();
    let title = html_escape::encode_text(&ctx.url_path);

    write!(
        out,
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
         <title>Index of {title}</title>\n<style>{STYLE}</style>\n</head>\n<body>\n\
         <h1>Index of {title}</h1>\n"
    )?;

    if ctx.upload_enabled {
        out.write_str(
            "<form method=\"post\" enctype=\"multipart/form-data\">\n\
             <input type=\"file\" name=\"file\" multiple>\n\
             <input type=\"submit\" value=\"Upload\">\n</form>\n",
        )?;
    }

    out.write_str("<table>\n<thead>\n<tr>")?;
    for key in SortKey::ALL {
        write!(
            out,
            "<th><a href=\"{}\">{}</a></th>",
            header_href(ctx, key),
            column_label(key)
        )?;
    }
    out.write_str("</tr>\n</thead>\n<tbody>\n")?;

    if !ctx.is_root {
        out.write_str("<tr><td><a href=\"../\">../</a></td><td></td><td></td><td></td></tr>\n")?;
    }

    for entry in &ctx.entries {
        write_row(&mut out, entry)?;
    }

    out.write_str("</tbody>\n</table>\n</body>\n</html>\n")?;
    Ok(out)
}

fn column_label(key: SortKey) -> &'static str {
    match key {
        SortKey::Name => "Name",
        SortKey::Size => "Size",
        SortKey::Time => "Modified",
        SortKey::Mode => "Mode",
    }
}

fn header_href(ctx: &ListingContext, key: SortKey) -> String {
    if key == ctx.sort_key {
        format!(
            "?sort={}&amp;by={}",
            key.as_str(),
            ctx.direction.flipped().as_str()
        )
    } else {
        format!("?sort={}", key.as_str())
    }
}

fn write_row(out: &mut String, entry: &FileEntry) -> fmt::Result {
    let suffix = if entry.is_dir { "/" } else { "" };
    let href = urlencoding::encode(&entry.name);
    let name = html_escape::encode_text(&entry.name);
    writeln!(
        out,
        "<tr><td><a href=\"./{href}{suffix}\">{name}{suffix}</a></td>\
         <td class=\"size\">{}</td><td>{}</td><td>{}</td></tr>",
        entry.size,
        entry.modified_display(),
        entry.mode_display(),
    )
}
