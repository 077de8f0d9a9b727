//! Re-renders a whole document through a [`RenderContext`].

use std::sync::Arc;

use crate::cache::{ContentKey, TargetSize, round_width};

use super::blocks::{Block, scan_blocks};
use super::context::{MountedView, PassSummary, RenderContext, Reuse};
use super::views::{CodeBlockView, ImageView, QuoteView, RuleView, TableView};

/// Images are laid out at the full text width with a 4:3 box.
const IMAGE_ASPECT: f64 = 0.75;

/// Result of one document render.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderSummary {
    pub blocks: usize,
    pub attachments: usize,
    pub pass: PassSummary,
}

/// Renders successive versions of one document, reusing views between passes.
pub struct DocumentRenderer {
    context: Arc<RenderContext>,
    width: f64,
    mounted: Vec<MountedView>,
    renders: u64,
}

impl DocumentRenderer {
    pub fn new(context: Arc<RenderContext>, width: f64) -> Self {
        Self {
            context,
            width,
            mounted: Vec::new(),
            renders: 0,
        }
    }

    pub fn context(&self) -> &Arc<RenderContext> {
        &self.context
    }

    pub fn renders(&self) -> u64 {
        self.renders
    }

    pub fn mounted_len(&self) -> usize {
        self.mounted.len()
    }

    pub fn render(&mut self, text: &str, streaming: bool) -> RenderSummary {
        let blocks = scan_blocks(text);
        let width = self.width;
        let context = Arc::clone(&self.context);
        let mut pass = context.begin_pass(std::mem::take(&mut self.mounted), streaming);
        let mut attachments = 0;

        for block in &blocks {
            match block {
                Block::Paragraph(_) => continue,
                Block::Code {
                    language,
                    code,
                    closed,
                } => {
                    // Highlighting waits for the closing fence.
                    let highlighted = *closed;
                    let key = ContentKey::code_block(
                        code,
                        language.as_deref(),
                        highlighted,
                        width,
                        false,
                    );
                    let (mut view, reuse) = pass.acquire(&key, CodeBlockView::default);
                    if reuse != Reuse::Exact {
                        view.configure(code, language.as_deref(), highlighted);
                    }
                    pass.mount(key, view);
                }
                Block::Table { rows } => {
                    let key = ContentKey::table(rows, width, false);
                    let (mut view, reuse) = pass.acquire(&key, TableView::default);
                    if reuse != Reuse::Exact {
                        view.layout(rows, width, context.measurements());
                    }
                    pass.mount(key, view);
                }
                Block::Quote(text) => {
                    let key = ContentKey::quote(text, &(), width, false);
                    let (mut view, reuse) = pass.acquire(&key, QuoteView::default);
                    if reuse != Reuse::Exact {
                        view.configure(text, width);
                    }
                    pass.mount(key, view);
                }
                Block::Rule => {
                    let key = ContentKey::rule(width, false);
                    let (view, _) = pass.acquire(&key, RuleView::default);
                    pass.mount(key, view);
                }
                Block::Image { source, .. } => {
                    let target = TargetSize::new(round_width(width), round_width(width * IMAGE_ASPECT));
                    let key = ContentKey::image(
                        source,
                        f64::from(target.width),
                        f64::from(target.height),
                        false,
                    );
                    let (mut view, reuse) = pass.acquire(&key, ImageView::default);
                    if reuse != Reuse::Exact {
                        view.source = Some(source.clone());
                        context
                            .images()
                            .fetch_into_slot(&view.slot, source.as_str(), target);
                    }
                    pass.mount(key, view);
                }
            }
            attachments += 1;
        }

        let (mounted, summary) = pass.finish();
        self.mounted = mounted;
        self.renders += 1;
        RenderSummary {
            blocks: blocks.len(),
            attachments,
            pass: summary,
        }
    }
}
