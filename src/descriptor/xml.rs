// Domain XML reading
//
// Parses a libvirt domain document with roxmltree and flattens its elements
// into owned nodes. Byte offsets into the original text are kept so that
// callers can splice replacements without reformatting the rest.

use std::ops::Range;

/// One element of the document, in document order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    /// Nesting depth, the root element is 0
    pub depth: usize,
    /// Whole element, opening tag through closing tag
    pub span: Range<usize>,
    /// Content between the tags (`None` for `<x/>`)
    pub inner: Option<Range<usize>>,
    text: Option<String>,
}

impl Node {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Trimmed text content, references and CDATA resolved
    pub fn text(&self) -> Option<String> {
        self.text.clone()
    }

    pub fn contains(&self, other: &Node) -> bool {
        match &self.inner {
            Some(inner) => other.span.start >= inner.start && other.span.end <= inner.end,
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum XmlError {
    #[error("{0}")]
    Syntax(String),
}

impl From<roxmltree::Error> for XmlError {
    fn from(e: roxmltree::Error) -> Self {
        Self::Syntax(e.to_string())
    }
}

/// Parse the document into a flat list of element nodes
pub fn parse(xml: &str) -> Result<Vec<Node>, XmlError> {
    let doc = roxmltree::Document::parse(xml)?;

    let nodes = doc
        .descendants()
        .filter(|n| n.is_element())
        .map(|n| {
            let span = n.range();
            let element = &xml[span.clone()];
            let inner = if element.ends_with("/>") {
                None
            } else {
                let open_end = tag_end(element).unwrap_or(element.len());
                let close_start = element.rfind("</").unwrap_or(element.len());
                Some(span.start + open_end..span.start + close_start)
            };
            Node {
                name: n.tag_name().name().to_string(),
                attrs: n
                    .attributes()
                    .map(|a| (a.name().to_string(), a.value().to_string()))
                    .collect(),
                depth: n.ancestors().filter(|a| a.is_element()).count() - 1,
                span,
                inner,
                text: n.text().map(|t| t.trim().to_string()),
            }
        })
        .collect();

    Ok(nodes)
}

// Offset just past the opening tag's '>', ignoring '>' inside quoted values
fn tag_end(element: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (offset, c) in element.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'') | (None, '"') => quote = Some(c),
            (None, '>') => return Some(offset + 1),
            _ => {}
        }
    }
    None
}

pub fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}
