use std::io::Cursor;
use std::path::Path;

use printpdf::{BuiltinFont, IndirectFontRef, Mm, PdfDocument, PdfDocumentReference};
use tracing::{debug, info};

use crate::error::RenderError;
use crate::models::Tier;

pub const CONTENT_PLACEHOLDER: &str = "{{GENERATED_CONTENT}}";
pub const DEFAULT_WATERMARK: &str = r#"<div class="watermark">Free version</div>"#;

const BUILTIN_TEMPLATE: &str = r#"<html>
<body>
<div class="watermark">Free version</div>
<div class="content">
{{GENERATED_CONTENT}}
</div>
<p class="footer">Generated by pamphlet</p>
</body>
</html>
"#;

const PAGE_WIDTH_MM: f32 = 210.0;
const PAGE_HEIGHT_MM: f32 = 297.0;
const MARGIN_MM: f32 = 15.0;
const FONT_SIZE_PT: f32 = 11.0;
const LINE_HEIGHT_MM: f32 = 6.0;
const WRAP_COLUMNS: usize = 90;

/// HTML document template with a single content placeholder.
#[derive(Debug, Clone)]
pub struct Template {
    html: String,
}

impl Template {
    pub fn parse(html: String) -> Result<Self, RenderError> {
        if !html.contains(CONTENT_PLACEHOLDER) {
            return Err(RenderError::Template(format!(
                "template has no {CONTENT_PLACEHOLDER} placeholder"
            )));
        }
        Ok(Self { html })
    }

    pub async fn load(path: &Path) -> Result<Self, RenderError> {
        let html = tokio::fs::read_to_string(path).await?;
        let template = Self::parse(html)?;
        info!(path = %path.display(), "PDF template loaded");
        Ok(template)
    }

    pub fn builtin() -> Self {
        Self {
            html: BUILTIN_TEMPLATE.to_string(),
        }
    }
}

/// Turns generated text into a deliverable document.
pub trait DocumentRenderer: Send + Sync {
    fn render(&self, content: &str, template: &Template, tier: Tier) -> Result<Vec<u8>, RenderError>;
}

pub struct PdfRenderer {
    watermark: String,
    /// TrueType font bytes. Without one, a builtin Latin-only font is used.
    font: Option<Vec<u8>>,
}

impl PdfRenderer {
    pub fn new(watermark: impl Into<String>, font: Option<Vec<u8>>) -> Self {
        Self {
            watermark: watermark.into(),
            font,
        }
    }

    /// Fill the template and reduce it to wrapped plain text. The watermark
    /// banner stays on the free tier and is removed for paid content.
    pub fn compose(&self, content: &str, template: &Template, tier: Tier) -> Result<String, RenderError> {
        let html = match tier {
            Tier::Free => template.html.clone(),
            Tier::Paid => template.html.replace(&self.watermark, ""),
        };
        let filled = html.replace(CONTENT_PLACEHOLDER, &markdown_to_html(content));

        html2text::from_read(filled.as_bytes(), WRAP_COLUMNS).map_err(|e| RenderError::Markup(e.to_string()))
    }

    fn load_font(&self, doc: &PdfDocumentReference) -> Result<IndirectFontRef, RenderError> {
        let font = match &self.font {
            Some(bytes) => doc.add_external_font(Cursor::new(bytes.as_slice())),
            None => doc.add_builtin_font(BuiltinFont::Helvetica),
        };
        font.map_err(|e| RenderError::Pdf(e.to_string()))
    }

    fn layout(&self, text: &str) -> Result<Vec<u8>, RenderError> {
        let (doc, page, layer) = PdfDocument::new("pamphlet", Mm(PAGE_WIDTH_MM), Mm(PAGE_HEIGHT_MM), "text");
        let font = self.load_font(&doc)?;
        let latin_only = self.font.is_none();

        let mut current = doc.get_page(page).get_layer(layer);
        let mut y = PAGE_HEIGHT_MM - MARGIN_MM;
        let mut pages = 1;

        for line in text.lines() {
            if y < MARGIN_MM {
                let (page, layer) = doc.add_page(Mm(PAGE_WIDTH_MM), Mm(PAGE_HEIGHT_MM), "text");
                current = doc.get_page(page).get_layer(layer);
                y = PAGE_HEIGHT_MM - MARGIN_MM;
                pages += 1;
            }
            if !line.trim().is_empty() {
                let line = if latin_only { to_latin1(line) } else { line.to_string() };
                current.use_text(line, FONT_SIZE_PT, Mm(MARGIN_MM), Mm(y), &font);
            }
            y -= LINE_HEIGHT_MM;
        }

        let bytes = doc.save_to_bytes().map_err(|e| RenderError::Pdf(e.to_string()))?;
        debug!(pages, bytes = bytes.len(), "PDF laid out");
        Ok(bytes)
    }
}

impl DocumentRenderer for PdfRenderer {
    fn render(&self, content: &str, template: &Template, tier: Tier) -> Result<Vec<u8>, RenderError> {
        let text = self.compose(content, template, tier)?;
        self.layout(&text)
    }
}

fn markdown_to_html(markdown: &str) -> String {
    let parser = pulldown_cmark::Parser::new(markdown);
    let mut html = String::new();
    pulldown_cmark::html::push_html(&mut html, parser);
    html
}

/// Builtin PDF fonts only cover Latin-1.
fn to_latin1(line: &str) -> String {
    line.chars().map(|c| if (c as u32) < 0x100 { c } else { '?' }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renderer() -> PdfRenderer {
        PdfRenderer::new(DEFAULT_WATERMARK, None)
    }

    #[test]
    fn template_without_placeholder_is_malformed() {
        assert!(matches!(
            Template::parse("<html>nothing here</html>".to_string()),
            Err(RenderError::Template(_))
        ));
    }

    #[test]
    fn paid_tier_strips_watermark_free_keeps_it() {
        let template = Template::builtin();
        let content = "# Solar power\n\nPanels convert **sunlight** into electricity.";

        let free = renderer().compose(content, &template, Tier::Free).unwrap();
        let paid = renderer().compose(content, &template, Tier::Paid).unwrap();

        assert!(free.contains("Free version"));
        assert!(!paid.contains("Free version"));
        for text in [&free, &paid] {
            assert!(text.contains("Solar power"));
            assert!(text.contains("Panels convert"));
            assert!(text.contains("sunlight"));
        }
    }

    #[test]
    fn markup_is_stripped() {
        let text = renderer()
            .compose("<b>bold</b> and *emphasis*", &Template::builtin(), Tier::Paid)
            .unwrap();
        assert!(!text.contains("<b>"));
        assert!(!text.contains("class="));
        assert!(text.contains("bold"));
    }

    #[test]
    fn renders_pdf_bytes() {
        let pdf = renderer()
            .render("Short body.", &Template::builtin(), Tier::Free)
            .unwrap();
        assert!(pdf.starts_with(b"%PDF"));
    }

    #[test]
    fn long_content_paginates() {
        let content: String = (0..200).map(|i| format!("Line number {i}\n\n")).collect();
        let pdf = renderer().render(&content, &Template::builtin(), Tier::Paid).unwrap();
        assert!(pdf.starts_with(b"%PDF"));
    }

    #[test]
    fn latin1_fallback_replaces_unsupported() {
        assert_eq!(to_latin1("café ماء"), "café ???");
    }
}
