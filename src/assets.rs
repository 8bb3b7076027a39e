//! Vector-to-raster asset conversion for the compatible build.
//!
//! Legacy renderers can't draw SVG, so every vector asset is rendered to
//! PNG (the cover to JPEG) and the package rewritten to match. The
//! titlepage and logo first get a faked outside stroke so they stay
//! legible against night-mode backgrounds.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::debug;

use crate::epub;
use crate::error::{Error, Result};
use crate::store::SourceTree;
use crate::tools::{ImageConverter, Rasterizer};

/// Outside-stroke width for the logo, in canvas units.
pub const LOGO_STROKE_WIDTH: u32 = 2;
/// Outside-stroke width for the titlepage, in canvas units.
pub const TITLEPAGE_STROKE_WIDTH: u32 = 4;
/// Content rasterization density; covers render at 1x.
pub const CONTENT_ZOOM: u32 = 2;
/// Kindle store thumbnail dimensions.
pub const THUMBNAIL_WIDTH: u32 = 432;
pub const THUMBNAIL_HEIGHT: u32 = 660;

// === Outline patterns ===

/// Matches the XML declaration.
static XML_DECL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<\?xml[^<]+?\?>").unwrap());

/// Matches the svg open or close tag.
static SVG_TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"</?svg[^<]*?>").unwrap());

/// Matches a title element with text content.
static SVG_TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<title>[^<]+?</title>").unwrap());

/// Matches a desc element with text content.
static SVG_DESC_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<desc>[^<]+?</desc>").unwrap());

/// Matches the first drawable element.
static FIRST_SHAPE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(<g|<path)").unwrap());

/// Matches the svg tag's integer height attribute.
static SVG_HEIGHT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<svg[^>]+?height="([0-9]+)""#).unwrap());

/// Matches the svg tag up to its height attribute, for replacement.
static SVG_HEIGHT_SUB_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<svg([^<]*?)height="[0-9]+""#).unwrap());

/// Matches the svg tag's integer width attribute.
static SVG_WIDTH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<svg[^>]+?width="([0-9]+)""#).unwrap());

/// Matches the svg tag up to its width attribute, for replacement.
static SVG_WIDTH_SUB_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<svg([^<]*?)width="[0-9]+""#).unwrap());

/// Fake `stroke-align: outside` on black vector art.
///
/// Every path is duplicated beneath the original with a white stroke of
/// the given width; since the originals sit directly on top, half the
/// stroke shows, entirely outside the shape. When the canvas declares
/// integer height and width both grow by the stroke width and the whole
/// drawing is recentered with a translate wrapper.
pub fn outline_strokes(svg: &str, stroke_width: u32) -> String {
    let mut paths = XML_DECL_RE.replace_all(svg, "").into_owned();
    paths = SVG_TAG_RE.replace_all(&paths, "").into_owned();
    paths = SVG_TITLE_RE.replace_all(&paths, "").into_owned();
    paths = SVG_DESC_RE.replace_all(&paths, "").into_owned();
    let stroke = format!("<path style=\"stroke: #ffffff; stroke-width: {stroke_width}px;\"");
    paths = paths.replace("<path", &stroke);

    let mut out = FIRST_SHAPE_RE
        .replace(svg, |caps: &Captures| format!("{paths}{}", &caps[1]))
        .into_owned();

    let height = SVG_HEIGHT_RE
        .captures(&out)
        .and_then(|caps| caps[1].parse::<u32>().ok());
    let width = SVG_WIDTH_RE
        .captures(&out)
        .and_then(|caps| caps[1].parse::<u32>().ok());
    if let (Some(height), Some(width)) = (height, width) {
        let height = height + stroke_width;
        let width = width + stroke_width;
        out = SVG_HEIGHT_SUB_RE
            .replace(&out, |caps: &Captures| {
                format!("<svg{}height=\"{height}\"", &caps[1])
            })
            .into_owned();
        out = SVG_WIDTH_SUB_RE
            .replace(&out, |caps: &Captures| {
                format!("<svg{}width=\"{width}\"", &caps[1])
            })
            .into_owned();
        let margin = stroke_width / 2;
        out = FIRST_SHAPE_RE
            .replace(&out, |caps: &Captures| {
                format!("<g transform=\"translate({margin}, {margin})\">\n{}", &caps[1])
            })
            .into_owned();
        out = out.replace("</svg>", "</g>\n</svg>");
    }
    out
}

/// Rewrite document references after rasterization: the cover now lives
/// as JPEG, everything else as PNG.
pub fn swap_vector_references(xhtml: &str) -> String {
    xhtml.replace("cover.svg", "cover.jpg").replace(".svg", ".png")
}

/// Render every SVG in the manifest and delete the source files. The
/// cover renders at 1x and is re-encoded as a stripped JPEG; the
/// titlepage and logo get their outside stroke first, then render at 2x
/// like any other content image.
pub fn rasterize_vectors(
    tree: &mut SourceTree,
    opf_rel: &Path,
    rasterizer: &dyn Rasterizer,
    images: &dyn ImageConverter,
) -> Result<()> {
    let opf_dir = opf_rel.parent().unwrap_or(Path::new("")).to_path_buf();
    let items = {
        let doc = tree.get(opf_rel)?;
        epub::manifest_items(doc.tree()?)
    };

    for item in &items {
        if item.media_type != "image/svg+xml" {
            continue;
        }
        let rel = epub::resolve_href(&opf_dir, &item.href);
        let abs = tree.abs(&rel);
        if !abs.is_file() {
            return Err(Error::MissingAsset(rel));
        }
        if has_property(item.properties.as_deref(), "cover-image") {
            let png = abs.with_extension("png");
            let jpg = abs.with_extension("jpg");
            rasterizer.rasterize(&abs, &png, 1)?;
            images.to_jpeg(&png, &jpg)?;
            images.strip_metadata(&jpg)?;
            std::fs::remove_file(&png)?;
        } else {
            let stem = abs
                .file_stem()
                .and_then(|stem| stem.to_str())
                .map(str::to_lowercase)
                .unwrap_or_default();
            if stem == "titlepage" || stem == "logo" {
                let stroke_width = if stem == "titlepage" {
                    TITLEPAGE_STROKE_WIDTH
                } else {
                    LOGO_STROKE_WIDTH
                };
                let outlined = outline_strokes(&std::fs::read_to_string(&abs)?, stroke_width);
                std::fs::write(&abs, outlined)?;
            }
            rasterizer.rasterize(&abs, &abs.with_extension("png"), CONTENT_ZOOM)?;
        }
        debug!(asset = %rel.display(), "rasterized vector asset");
        tree.remove(&rel)?;
    }
    Ok(())
}

/// Rewrite the package manifest after rasterization: hrefs, ids, and
/// media types move from SVG to their raster replacements, and the `svg`
/// property is dropped from documents that no longer embed any.
pub fn swap_vector_manifest(tree: &mut SourceTree, opf_rel: &Path) -> Result<()> {
    let items = {
        let doc = tree.get(opf_rel)?;
        epub::manifest_items(doc.tree()?)
    };
    let opf_dir = opf_rel.parent().unwrap_or(Path::new("")).to_path_buf();

    // A document keeps the property only while it still embeds an svg
    // element; references to .svg files have already been rewritten.
    let mut keep_svg: Vec<String> = Vec::new();
    for item in &items {
        if item.media_type == "application/xhtml+xml"
            && has_property(item.properties.as_deref(), "svg")
        {
            let rel = epub::resolve_href(&opf_dir, &item.href);
            if tree.get(&rel)?.text().contains("<svg") {
                keep_svg.push(item.href.clone());
            }
        }
    }

    let doc = tree.get(opf_rel)?;
    let opf = doc.tree_mut()?;
    for node in opf.find_all_by_tag("item") {
        let media_type = opf.get_attr(node, "media-type").map(str::to_string);
        let href = opf.get_attr(node, "href").map(str::to_string);
        let id = opf.get_attr(node, "id").map(str::to_string);
        let properties = opf.get_attr(node, "properties").map(str::to_string);

        if media_type.as_deref() == Some("image/svg+xml") {
            let is_cover = properties
                .as_deref()
                .map(|props| props.split_whitespace().any(|token| token == "cover-image"))
                .unwrap_or(false);
            let (extension, raster_type) = if is_cover {
                ("jpg", "image/jpeg")
            } else {
                ("png", "image/png")
            };
            if let Some(href) = &href {
                opf.set_attr(node, "href", &swap_extension(href, extension));
            }
            if let Some(id) = &id {
                if id.ends_with(".svg") {
                    opf.set_attr(node, "id", &swap_extension(id, extension));
                }
            }
            opf.set_attr(node, "media-type", raster_type);
        } else if let Some(props) = &properties {
            let keeps = href.as_deref().map(|h| keep_svg.iter().any(|k| k == h)).unwrap_or(false);
            if !keeps && props.split_whitespace().any(|token| token == "svg") {
                let remaining: Vec<&str> =
                    props.split_whitespace().filter(|token| *token != "svg").collect();
                if remaining.is_empty() {
                    opf.remove_attr(node, "properties");
                } else {
                    opf.set_attr(node, "properties", &remaining.join(" "));
                }
            }
        }
    }
    Ok(())
}

/// Write the Kindle store thumbnail next to the other artifacts.
pub fn kindle_thumbnail(
    cover: &Path,
    output_dir: &Path,
    asin: &str,
    images: &dyn ImageConverter,
) -> Result<PathBuf> {
    let path = output_dir.join(format!("thumbnail_{asin}_EBOK_portrait.jpg"));
    images.resize(cover, &path, THUMBNAIL_WIDTH, THUMBNAIL_HEIGHT)?;
    Ok(path)
}

fn has_property(properties: Option<&str>, token: &str) -> bool {
    properties
        .map(|props| props.split_whitespace().any(|t| t == token))
        .unwrap_or(false)
}

fn swap_extension(name: &str, extension: &str) -> String {
    match name.strip_suffix(".svg") {
        Some(stem) => format!("{stem}.{extension}"),
        None => name.to_string(),
    }
}
