//! Kiln-generated sections inside issue bodies.
//!
//! Generated content lives between literal HTML comment markers so that edits
//! can be targeted without disturbing anything a human wrote:
//!
//! ```text
//! <!-- kiln:research --> ... <!-- /kiln:research -->
//! <!-- kiln:plan --> ... <!-- /kiln:plan -->
//! ```
//!
//! Every operation here preserves all bytes outside the markers exactly.

/// A kiln-managed section of an issue body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Research,
    Plan,
}

impl Section {
    pub const ALL: [Section; 2] = [Section::Research, Section::Plan];

    pub fn start_marker(self) -> &'static str {
        match self {
            Section::Research => "<!-- kiln:research -->",
            Section::Plan => "<!-- kiln:plan -->",
        }
    }

    pub fn end_marker(self) -> &'static str {
        match self {
            Section::Research => "<!-- /kiln:research -->",
            Section::Plan => "<!-- /kiln:plan -->",
        }
    }

    /// Human-readable name used in executor prompts.
    pub fn target_name(self) -> &'static str {
        match self {
            Section::Research => "research",
            Section::Plan => "plan",
        }
    }
}

/// Locates a section's span: `(start_of_start_marker, end_of_end_marker)`.
///
/// Returns `None` when either marker is missing or they appear out of order.
fn section_span(body: &str, section: Section) -> Option<(usize, usize)> {
    let start = body.find(section.start_marker())?;
    let content_start = start + section.start_marker().len();
    let end_rel = body[content_start..].find(section.end_marker())?;
    let end = content_start + end_rel + section.end_marker().len();
    Some((start, end))
}

/// Returns the content between a section's markers, if the section exists.
pub fn extract_section(body: &str, section: Section) -> Option<&str> {
    let (start, end) = section_span(body, section)?;
    let content_start = start + section.start_marker().len();
    let content_end = end - section.end_marker().len();
    Some(&body[content_start..content_end])
}

/// Replaces the content of a section, or appends the section if absent.
///
/// All bytes outside the markers are preserved exactly.
pub fn replace_section(body: &str, section: Section, content: &str) -> String {
    match section_span(body, section) {
        Some((start, end)) => {
            let mut out = String::with_capacity(body.len() + content.len());
            out.push_str(&body[..start]);
            out.push_str(section.start_marker());
            out.push_str(content);
            out.push_str(section.end_marker());
            out.push_str(&body[end..]);
            out
        }
        None => {
            let mut out = String::with_capacity(body.len() + content.len() + 64);
            out.push_str(body);
            if !body.is_empty() && !body.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(section.start_marker());
            out.push_str(content);
            out.push_str(section.end_marker());
            out
        }
    }
}

/// Removes every kiln section, markers included.
///
/// Used by the reset path: the surrounding bytes (including any whitespace
/// that framed the section) are left untouched.
pub fn strip_sections(body: &str) -> String {
    let mut out = body.to_string();
    for section in Section::ALL {
        while let Some((start, end)) = section_span(&out, section) {
            out.replace_range(start..end, "");
        }
    }
    out
}
