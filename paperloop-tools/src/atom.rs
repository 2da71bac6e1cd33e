//! Atom feed parser for arXiv API responses.
//!
//! A small tag scanner rather than a full XML parser: the arXiv feed is flat
//! and regular, and every field it carries is either element text or an
//! attribute on a self-closing tag.

use paperloop_core::error::FetchError;
use paperloop_core::types::PaperRef;

/// A parsed search response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AtomFeed {
    /// `opensearch:totalResults`, the number of matches upstream.
    pub total_results: usize,
    pub papers: Vec<PaperRef>,
}

/// Parse an arXiv Atom response.
///
/// Entries never fail individually: missing fields become empty strings.
/// A body that is not a feed, or that cuts off mid-entry, is malformed. The
/// API reports bad queries as a feed with a single error entry, which is
/// surfaced as `InvalidArgument`.
pub fn parse_feed(xml: &str) -> Result<AtomFeed, FetchError> {
    if !xml.contains("<feed") {
        return Err(malformed("response is not an Atom feed"));
    }

    let total_results = extract_tag_text(xml, "opensearch:totalResults")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    let mut papers = Vec::new();
    for entry in extract_entries(xml)? {
        if let Some(id) = extract_tag_text(entry, "id")
            && id.contains("/api/errors")
        {
            let message = extract_tag_text(entry, "summary")
                .map(|s| clean_text(&s))
                .unwrap_or(id);
            return Err(FetchError::InvalidArgument { message });
        }
        papers.push(parse_entry(entry));
    }

    Ok(AtomFeed {
        total_results,
        papers,
    })
}

fn malformed(message: impl Into<String>) -> FetchError {
    FetchError::MalformedResponse {
        message: message.into(),
    }
}

/// All `<entry>...</entry>` blocks, in document order.
fn extract_entries(xml: &str) -> Result<Vec<&str>, FetchError> {
    const START: &str = "<entry>";
    const END: &str = "</entry>";

    let mut entries = Vec::new();
    let mut search_from = 0;
    while let Some(pos) = xml[search_from..].find(START) {
        let start = search_from + pos;
        let Some(len) = xml[start..].find(END) else {
            return Err(malformed("unterminated <entry> element"));
        };
        let end = start + len + END.len();
        entries.push(&xml[start..end]);
        search_from = end;
    }
    Ok(entries)
}

/// Normalize one entry into a [`PaperRef`].
pub fn parse_entry(entry: &str) -> PaperRef {
    let id_url = extract_tag_text(entry, "id").unwrap_or_default();
    let id = extract_arxiv_id_from_url(&id_url);

    let authors = blocks(entry, "author")
        .filter_map(|block| extract_tag_text(block, "name"))
        .map(|name| clean_text(&name))
        .filter(|name| !name.is_empty())
        .collect();

    let categories = tags(entry, "category")
        .filter_map(|tag| extract_attribute(tag, "term"))
        .collect();

    let primary_category = tags(entry, "arxiv:primary_category")
        .next()
        .and_then(|tag| extract_attribute(tag, "term"))
        .unwrap_or_default();

    let mut abs_url = None;
    let mut pdf_url = None;
    for link in tags(entry, "link") {
        let href = extract_attribute(link, "href").unwrap_or_default();
        let title = extract_attribute(link, "title").unwrap_or_default();
        let link_type = extract_attribute(link, "type").unwrap_or_default();
        let rel = extract_attribute(link, "rel").unwrap_or_default();

        if title == "pdf" || link_type == "application/pdf" {
            pdf_url.get_or_insert(href);
        } else if rel == "alternate" {
            abs_url.get_or_insert(href);
        }
    }
    let abs_url = abs_url
        .filter(|url| !url.is_empty())
        .unwrap_or_else(|| format!("https://arxiv.org/abs/{}", id));

    let text = |tag: &str| {
        extract_tag_text(entry, tag)
            .map(|s| clean_text(&s))
            .unwrap_or_default()
    };

    PaperRef {
        title: text("title"),
        authors,
        summary: text("summary"),
        published: text("published"),
        updated: text("updated"),
        primary_category,
        categories,
        pdf_url: pdf_url.unwrap_or_default(),
        abs_url,
        comment: text("arxiv:comment"),
        journal_ref: text("arxiv:journal_ref"),
        doi: text("arxiv:doi"),
        id,
    }
}

/// Text content of the first `<tag ...>text</tag>`, with entities decoded.
fn extract_tag_text(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);

    let mut search_from = 0;
    loop {
        let start = search_from + xml[search_from..].find(&open)?;
        let after_name = start + open.len();
        // `<id` must not match `<idx>`; the name ends at `>`, `/` or whitespace.
        match xml[after_name..].chars().next() {
            Some(c) if c == '>' || c == '/' || c.is_whitespace() => {}
            _ => {
                search_from = after_name;
                continue;
            }
        }
        let open_end = after_name + xml[after_name..].find('>')?;
        if xml[..open_end].ends_with('/') {
            return Some(String::new());
        }
        let content_start = open_end + 1;
        let content_end = content_start + xml[content_start..].find(&close)?;
        return Some(decode_entities(xml[content_start..content_end].trim()));
    }
}

/// Every opening (or self-closing) `<tag ...>` in `xml`.
fn tags<'a>(xml: &'a str, tag: &str) -> impl Iterator<Item = &'a str> + 'a {
    let open = format!("<{}", tag);
    let mut search_from = 0;
    std::iter::from_fn(move || {
        loop {
            let start = search_from + xml[search_from..].find(&open)?;
            let after_name = start + open.len();
            let end = after_name + xml[after_name..].find('>')? + 1;
            search_from = end;
            match xml[after_name..].chars().next() {
                Some(c) if c == '>' || c == '/' || c.is_whitespace() => return Some(&xml[start..end]),
                _ => continue,
            }
        }
    })
}

/// Every `<tag>...</tag>` block in `xml`.
fn blocks<'a>(xml: &'a str, tag: &str) -> impl Iterator<Item = &'a str> + 'a {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut search_from = 0;
    std::iter::from_fn(move || {
        let start = search_from + xml[search_from..].find(&open)?;
        let end = start + xml[start..].find(&close)? + close.len();
        search_from = end;
        Some(&xml[start..end])
    })
}

/// Extract an attribute value from a tag string.
pub fn extract_attribute(tag: &str, attr: &str) -> Option<String> {
    let search = format!(" {}=\"", attr);
    let start = tag.find(&search)? + search.len();
    let end = tag[start..].find('"')? + start;
    Some(decode_entities(&tag[start..end]))
}

/// The identifier at the end of an abstract or PDF URL.
pub fn extract_arxiv_id_from_url(url: &str) -> String {
    if let Some(pos) = url.rfind("/abs/") {
        url[pos + 5..].to_string()
    } else if let Some(pos) = url.rfind("/pdf/") {
        url[pos + 5..].trim_end_matches(".pdf").to_string()
    } else {
        url.to_string()
    }
}

/// Collapse runs of whitespace into single spaces.
pub fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn clean_text(s: &str) -> String {
    normalize_whitespace(s)
}

/// Decode the five predefined XML entities and numeric character references.
pub fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let decoded = tail.find(';').and_then(|semi| {
            let entity = &tail[1..semi];
            let ch = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => entity
                    .strip_prefix("#x")
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                    .and_then(char::from_u32),
            };
            ch.map(|c| (c, semi + 1))
        });
        match decoded {
            Some((c, consumed)) => {
                out.push(c);
                rest = &tail[consumed..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
