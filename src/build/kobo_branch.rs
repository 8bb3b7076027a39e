//! The Kobo branch: a KEPUB derived from the compatible tree.
//!
//! Kobo firmware keeps popup-spelled notes out of the reading flow, so the
//! popup rename from the shared stage is reversed here, and every document
//! gets the `koboSpan` segmentation the reader needs for positions and
//! highlights.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};

use crate::build::{copy_tree, is_endnotes, survey, transform_marker};
use crate::epub;
use crate::error::Result;
use crate::kobo;
use crate::store::SourceTree;

/// Matches the adjacent popup alias pair the shared stage produced.
static POPUP_ALIAS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("footnote(s?) rearnote(s?)").unwrap());

/// Build the `.kepub.epub` into the scratch directory, returning its path
/// and file name.
pub(crate) fn build(scratch: &Path, work: &Path, basename: &str) -> Result<(PathBuf, String)> {
    let root = scratch.join("kobo");
    copy_tree(work, &root)?;
    let mut tree = SourceTree::open(&root)?;
    let plan = survey(&mut tree)?;

    let mut spans = 0usize;
    for rel in &plan.documents {
        if *rel == plan.toc_rel {
            continue;
        }
        let in_endnotes = is_endnotes(rel);
        let doc = tree.get(rel)?;
        doc.rewrite_text(|text| {
            let text = restore_endnote_semantics(text);
            if in_endnotes {
                kobo::swap_referrer_glyph(&text)
            } else {
                text
            }
        });
        spans += kobo::add_spans(doc.tree_mut()?);
        debug!(file = %rel.display(), "segmented");
    }
    info!(spans, "segmented for kobo");

    for rel in &plan.stylesheets {
        let doc = tree.get(rel)?;
        doc.rewrite_text(restore_endnote_styles);
    }

    transform_marker(&mut tree, &plan.opf_rel, "kobo")?;
    tree.save_all()?;

    let name = format!("{basename}.kepub.epub");
    let path = scratch.join(&name);
    epub::write_container(&root, &path)?;
    info!(artifact = %name, "packaged");
    Ok((path, name))
}

/// Undo the popup rename: `footnote rearnote` pairs collapse back to
/// `endnote`, and the simplified class twins follow.
fn restore_endnote_semantics(xhtml: &str) -> String {
    let out = POPUP_ALIAS_RE.replace_all(xhtml, "endnote$1").into_owned();
    out.replace("epub-type-footnote", "epub-type-endnote")
}

fn restore_endnote_styles(css: &str) -> String {
    css.replace("footnote", "endnote")
}
