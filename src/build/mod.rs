//! The build pipeline: one source tree in, up to four artifacts out.
//!
//! Every build copies the source into a scratch directory and works there;
//! the requested output directory only ever sees finished artifacts. The
//! pristine tree is packaged first, then the shared compatibility stage
//! rewrites the working tree for legacy renderers, and the Kobo and Kindle
//! branches derive their formats from that rewritten tree.

mod kindle;
mod kobo_branch;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Timelike, Utc};
use regex::Regex;
use sha1_smol::Sha1;
use tracing::{debug, info, warn};

use crate::compat;
use crate::endnotes;
use crate::epub;
use crate::error::{Error, Result};
use crate::ncx;
use crate::store::SourceTree;
use crate::tools::{BuildMessage, Toolbox};
use crate::{assets, css};

/// What to build and where.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
    pub kobo: bool,
    pub kindle: bool,
    pub check_only: bool,
}

/// What a build produced. `messages` is non-empty exactly when validation
/// failed; in that case no artifacts were copied out.
#[derive(Debug, Default)]
pub struct BuildOutcome {
    pub artifacts: Vec<PathBuf>,
    pub messages: Vec<BuildMessage>,
}

/// Reject a source directory that is not a container layout. Split out of
/// [`build`] so the CLI can fail on a bad path before probing tools.
pub fn check_source(source_dir: &Path) -> Result<()> {
    if !source_dir.join("META-INF/container.xml").is_file() {
        return Err(Error::InvalidSource(format!(
            "{} is not a container layout (no META-INF/container.xml)",
            source_dir.display()
        )));
    }
    Ok(())
}

/// Run the full pipeline against `options.source_dir`.
pub fn build(options: &BuildOptions, tools: &Toolbox) -> Result<BuildOutcome> {
    let source_dir = &options.source_dir;
    check_source(source_dir)?;
    info!(source = %source_dir.display(), "building");

    fs::create_dir_all(&options.output_dir)?;

    let scratch = tempfile::tempdir()?;
    let work = scratch.path().join("src");
    copy_tree(source_dir, &work)?;

    let mut tree = SourceTree::open(&work)?;
    let opf_rel = epub::find_opf_path(tree.root())?;

    let meta = {
        let doc = tree.get(&opf_rel)?;
        epub::metadata(doc.tree()?)?
    };
    let asin = asin_of(&meta.identifier);
    let basename = artifact_basename(&meta);
    debug!(%basename, %asin, "derived artifact identity");

    stamp_release(&mut tree, &opf_rel, Utc::now())?;

    if !options.check_only {
        clean_previous(&options.output_dir, &basename, &asin)?;
    }

    // The pristine tree, before any compatibility rewrites.
    tree.save_all()?;
    let pure_name = format!("{basename}_advanced.epub");
    let pure_path = scratch.path().join(&pure_name);
    epub::write_container(&work, &pure_path)?;
    info!(artifact = %pure_name, "packaged");

    compatible_stage(&mut tree, tools)?;
    tree.save_all()?;

    let compat_name = format!("{basename}.epub");
    let compat_path = scratch.path().join(&compat_name);
    epub::write_container(&work, &compat_path)?;
    info!(artifact = %compat_name, "packaged");

    // Every enabled validator runs to completion so the report is whole
    // even when the first tool already found problems.
    let mut messages = Vec::new();
    for validator in &tools.validators {
        let target: &Path = if validator.name() == "vnu" {
            &work
        } else {
            &compat_path
        };
        let found = validator.validate(target)?;
        info!(validator = validator.name(), count = found.len(), "validated");
        messages.extend(found);
    }
    if !messages.is_empty() {
        warn!(count = messages.len(), "validation reported messages");
        return Ok(BuildOutcome {
            artifacts: Vec::new(),
            messages,
        });
    }

    if options.check_only {
        info!("check passed");
        return Ok(BuildOutcome::default());
    }

    let mut staged: Vec<(PathBuf, String)> =
        vec![(pure_path, pure_name), (compat_path, compat_name)];

    if options.kobo {
        staged.push(kobo_branch::build(scratch.path(), &work, &basename)?);
    }

    if options.kindle {
        let converter = tools
            .kindle
            .as_deref()
            .ok_or_else(|| Error::MissingDependency("ebook-convert".to_string()))?;
        staged.extend(kindle::build(
            scratch.path(),
            &mut tree,
            &basename,
            &asin,
            tools,
            converter,
        )?);
    }

    // Artifacts land in the output directory only once every requested
    // target finished.
    let mut artifacts = Vec::new();
    for (path, name) in staged {
        let dest = options.output_dir.join(&name);
        fs::copy(&path, &dest)?;
        artifacts.push(dest);
    }
    info!(count = artifacts.len(), "build complete");
    Ok(BuildOutcome {
        artifacts,
        messages,
    })
}

/// What the compatibility stage needs to know about the publication, read
/// once from the manifest.
pub(crate) struct Survey {
    pub opf_rel: PathBuf,
    pub opf_dir: PathBuf,
    pub toc_rel: PathBuf,
    pub stylesheets: Vec<PathBuf>,
    pub documents: Vec<PathBuf>,
}

pub(crate) fn survey(tree: &mut SourceTree) -> Result<Survey> {
    let opf_rel = epub::find_opf_path(tree.root())?;
    let opf_dir = opf_rel.parent().unwrap_or(Path::new("")).to_path_buf();
    let items = {
        let doc = tree.get(&opf_rel)?;
        epub::manifest_items(doc.tree()?)
    };
    epub::check_manifest(tree, &opf_dir, &items)?;

    let toc_href = items
        .iter()
        .find(|item| {
            item.properties
                .as_deref()
                .is_some_and(|props| props.split_whitespace().any(|p| p == "nav"))
        })
        .map(|item| item.href.clone())
        .ok_or_else(|| Error::InvalidSource("manifest has no nav document".to_string()))?;
    let toc_rel = epub::resolve_href(&opf_dir, &toc_href);

    let mut stylesheets = Vec::new();
    let mut documents = Vec::new();
    for item in &items {
        let rel = epub::resolve_href(&opf_dir, &item.href);
        match item.media_type.as_str() {
            "text/css" => stylesheets.push(rel),
            "application/xhtml+xml" => documents.push(rel),
            _ => {}
        }
    }
    Ok(Survey {
        opf_rel,
        opf_dir,
        toc_rel,
        stylesheets,
        documents,
    })
}

/// The shared compatibility rewrite, in stage order. Running it a second
/// time on its own output is a no-op for every document.
pub fn compatible_stage(tree: &mut SourceTree, tools: &Toolbox) -> Result<()> {
    let plan = survey(tree)?;

    // Stylesheets first: the appended compatibility rules want the same
    // selector simplification as the book's own.
    if let Some(core) = core_stylesheet(&plan.stylesheets) {
        let doc = tree.get(core)?;
        doc.rewrite_text(|text| {
            let mut text = compat::strip_abbr_rules(text);
            if !text.contains("Legacy renderer fixes") {
                text.push_str(compat::COMPATIBILITY_CSS);
            }
            text
        });
    }

    let mut simplifier = css::Simplifier::new();
    for rel in &plan.stylesheets {
        let doc = tree.get(rel)?;
        let simplified = simplifier.simplify(doc.text());
        doc.set_text(simplified);
    }
    simplifier.apply_classes(tree, &plan.documents, &plan.toc_rel)?;
    info!("simplified stylesheets");

    for rel in &plan.documents {
        let in_endnotes = is_endnotes(rel);
        let in_titlepage = has_stem(rel, "titlepage");
        let doc = tree.get(rel)?;
        doc.rewrite_text(|text| {
            let text = compat::mirror_aria_roles(text, in_endnotes);
            let text = compat::convert_endnote_semantics(&text);
            let text = if in_endnotes {
                compat::referrer_text_presentation(&text)
            } else {
                text
            };
            let text = compat::mirror_lang_attributes(&text);
            let text = compat::downgrade_typography(&text);
            compat::mark_raster_night_mode(&text, in_titlepage)
        });
        debug!(file = %rel.display(), "rewrote for compatibility");
    }

    let endnotes_rel = plan.opf_dir.join("text/endnotes.xhtml");
    if tree.exists(&endnotes_rel) {
        endnotes::chunk_endnotes(tree, &plan.opf_rel, &endnotes_rel)?;
    }

    // Re-survey: chunking may have added documents, and they need the
    // raster reference rewrite along with everyone else.
    let plan = survey(tree)?;
    assets::rasterize_vectors(
        tree,
        &plan.opf_rel,
        tools.rasterizer.as_ref(),
        tools.images.as_ref(),
    )?;
    assets::swap_vector_manifest(tree, &plan.opf_rel)?;
    for rel in &plan.documents {
        let doc = tree.get(rel)?;
        doc.rewrite_text(|text| assets::swap_vector_references(text));
    }

    for rel in &plan.stylesheets {
        let doc = tree.get(rel)?;
        doc.rewrite_text(|text| {
            let text = compat::alias_break_properties(text);
            let text = compat::prefix_hyphen_properties(&text);
            compat::convert_endnote_styles(&text)
        });
    }

    ncx::generate(tree, &plan.opf_rel, &plan.toc_rel)?;
    transform_marker(tree, &plan.opf_rel, "compatibility")?;

    canonicalize_tree(tree, tools)?;
    info!("compatibility stage complete");
    Ok(())
}

/// Run every dirty markup file through the canonicalizer so hand-edited
/// and machine-edited documents serialize identically.
pub(crate) fn canonicalize_tree(tree: &mut SourceTree, tools: &Toolbox) -> Result<()> {
    for rel in tree.loaded() {
        let canonical_kind = matches!(
            rel.extension().and_then(|e| e.to_str()),
            Some("xhtml" | "opf" | "ncx" | "svg")
        );
        if !canonical_kind {
            continue;
        }
        let abs = tree.abs(&rel);
        let doc = tree.get(&rel)?;
        if !doc.is_dirty() {
            continue;
        }
        let canonical = tools.canonicalizer.canonicalize(&abs, doc.text())?;
        doc.set_text(canonical);
    }
    Ok(())
}

pub(crate) fn core_stylesheet(stylesheets: &[PathBuf]) -> Option<&PathBuf> {
    stylesheets
        .iter()
        .find(|rel| has_stem(rel, "core"))
        .or_else(|| stylesheets.first())
}

pub(crate) fn is_endnotes(rel: &Path) -> bool {
    rel.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("endnotes"))
}

fn has_stem(rel: &Path, stem: &str) -> bool {
    rel.file_stem().and_then(|s| s.to_str()) == Some(stem)
}

/// The ASIN is by convention the SHA-1 of the book's identifying URL.
pub(crate) fn asin_of(identifier: &str) -> String {
    let url = identifier.strip_prefix("url:").unwrap_or(identifier);
    Sha1::from(url.as_bytes()).digest().to_string()
}

/// `author_title` with every part url-safe, multiple authors joined with
/// underscores.
pub(crate) fn artifact_basename(meta: &epub::Metadata) -> String {
    let mut parts: Vec<String> = meta.authors.iter().map(|a| url_slug(a)).collect();
    parts.push(url_slug(&meta.title));
    parts.retain(|part| !part.is_empty());
    parts.join("_")
}

/// Lowercase, unaccent, drop apostrophes, dash-separate. Covers the Latin
/// letters that actually occur in our metadata.
pub(crate) fn url_slug(text: &str) -> String {
    let mut folded = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '\'' || c == '\u{2019}' {
            continue;
        }
        if c.is_ascii_alphanumeric() {
            folded.push(c.to_ascii_lowercase());
        } else if let Some(base) = fold_accent(c) {
            folded.push_str(base);
        } else {
            folded.push(' ');
        }
    }
    folded.split_whitespace().collect::<Vec<_>>().join("-")
}

fn fold_accent(c: char) -> Option<&'static str> {
    Some(match c.to_lowercase().next().unwrap_or(c) {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => "a",
        'æ' => "ae",
        'ç' => "c",
        'è' | 'é' | 'ê' | 'ë' => "e",
        'ì' | 'í' | 'î' | 'ï' => "i",
        'ñ' => "n",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' => "o",
        'ù' | 'ú' | 'û' | 'ü' => "u",
        'ý' | 'ÿ' => "y",
        'ß' => "ss",
        'œ' => "oe",
        _ => return None,
    })
}

static MODIFIED_META_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<meta property="dcterms:modified">[^<]+?</meta>"#).unwrap()
});

/// Stamp the release time into the OPF `dcterms:modified` meta and the
/// colophon's release slot, when the colophon carries one.
pub(crate) fn stamp_release(
    tree: &mut SourceTree,
    opf_rel: &Path,
    now: DateTime<Utc>,
) -> Result<()> {
    let iso = now.format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let doc = tree.get(opf_rel)?;
    doc.rewrite_text(|text| {
        MODIFIED_META_RE
            .replace(
                text,
                format!("<meta property=\"dcterms:modified\">{iso}</meta>"),
            )
            .into_owned()
    });

    let opf_dir = opf_rel.parent().unwrap_or(Path::new("")).to_path_buf();
    let colophon_rel = opf_dir.join("text/colophon.xhtml");
    if tree.exists(&colophon_rel) {
        let friendly = friendly_timestamp(now);
        let doc = tree.get(&colophon_rel)?;
        doc.rewrite_text(|text| {
            text.replace(
                "<p>The first edition of this ebook was released on<br/>",
                &format!(
                    "<p>This edition was released on<br/>\n\t\t\t<b>{friendly}</b>.<br/>\n\t\t\tThe first edition of this ebook was released on<br/>"
                ),
            )
        });
    }
    Ok(())
}

/// `March 9, 2026, 5:04 <abbr class="time eoc">p.m.</abbr>` form, no
/// padding in day or hour.
pub(crate) fn friendly_timestamp(now: DateTime<Utc>) -> String {
    let date = now.format("%B %-d, %Y").to_string();
    let (is_pm, hour12) = now.hour12();
    let meridiem = if is_pm { "p.m." } else { "a.m." };
    format!(
        "{date}, {hour12}:{:02} <abbr class=\"time eoc\">{meridiem}</abbr>",
        now.minute()
    )
}

/// Mark the OPF as a transform build so the file can't be mistaken for
/// the pristine source.
pub(crate) fn transform_marker(tree: &mut SourceTree, opf_rel: &Path, kind: &str) -> Result<()> {
    static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"<meta property="se:transform">[^<]*</meta>"#).unwrap()
    });
    let marker = format!("<meta property=\"se:transform\">{kind}</meta>");
    let doc = tree.get(opf_rel)?;
    doc.rewrite_text(|text| {
        if MARKER_RE.is_match(text) {
            MARKER_RE.replace(text, marker.as_str()).into_owned()
        } else if text.contains("<dc:publisher") {
            text.replacen("<dc:publisher", &format!("{marker}\n\t\t<dc:publisher"), 1)
        } else {
            text.replacen("</metadata>", &format!("\t{marker}\n\t</metadata>"), 1)
        }
    });
    Ok(())
}

/// Remove artifacts a previous build may have left for this publication.
fn clean_previous(output_dir: &Path, basename: &str, asin: &str) -> Result<()> {
    let names = [
        format!("{basename}.epub"),
        format!("{basename}_advanced.epub"),
        format!("{basename}.kepub.epub"),
        format!("{basename}.azw3"),
        format!("thumbnail_{asin}_EBOK_portrait.jpg"),
    ];
    for name in names {
        match fs::remove_file(output_dir.join(&name)) {
            Ok(()) => debug!(%name, "removed previous artifact"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Copy a directory tree, skipping VCS metadata.
pub(crate) fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let name = entry.file_name();
        if matches!(
            name.to_str(),
            Some(".git" | ".svn" | ".hg" | ".bzr")
        ) {
            continue;
        }
        let src = entry.path();
        let dst = to.join(&name);
        if entry.file_type()?.is_dir() {
            copy_tree(&src, &dst)?;
        } else {
            fs::copy(&src, &dst)?;
        }
    }
    Ok(())
}
