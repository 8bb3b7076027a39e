//! Wrappers for the external binaries the build shells out to.
//!
//! Each tool gets one trait so the orchestrator never touches
//! `std::process` itself, and so tests can swap in canned implementations.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};

// === Probing ===

/// Search a PATH-style variable for the first candidate that resolves to an
/// executable file. Candidate order outranks directory order, so `magick`
/// anywhere on PATH wins over `convert`.
fn search_path(path_var: &OsStr, candidates: &[&str]) -> Option<PathBuf> {
    for candidate in candidates {
        for dir in std::env::split_paths(path_var) {
            let full = dir.join(candidate);
            if is_executable(&full) {
                return Some(full);
            }
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Locate a binary by trying each candidate name on PATH.
pub fn find_binary(candidates: &[&str]) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    search_path(&path_var, candidates)
}

/// Probe for a required binary; missing is fatal and names the tool.
pub fn require_binary(name: &str, candidates: &[&str]) -> Result<PathBuf> {
    find_binary(candidates).ok_or_else(|| Error::MissingDependency(name.to_string()))
}

// === Invocation ===

/// Captured streams of one finished subprocess.
pub struct ToolOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run a subprocess to completion with both streams spooled to unlinked
/// temp files, so a large report never deadlocks the child on a full pipe.
pub fn run_captured<I, S>(binary: &Path, args: I) -> Result<ToolOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut stdout_spool = tempfile::tempfile()?;
    let mut stderr_spool = tempfile::tempfile()?;
    debug!(binary = %binary.display(), "running external tool");
    let status = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_spool.try_clone()?))
        .stderr(Stdio::from(stderr_spool.try_clone()?))
        .status()?;

    let mut stdout = String::new();
    stdout_spool.seek(SeekFrom::Start(0))?;
    stdout_spool.read_to_string(&mut stdout)?;
    let mut stderr = String::new();
    stderr_spool.seek(SeekFrom::Start(0))?;
    stderr_spool.read_to_string(&mut stderr)?;

    Ok(ToolOutput {
        success: status.success(),
        stdout,
        stderr,
    })
}

/// Last non-empty line of a tool's output, for error detail.
fn last_line(text: &str) -> String {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("no output")
        .to_string()
}

// === Findings ===

/// Severity of one validator finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        };
        f.write_str(label)
    }
}

/// One finding from a validator, normalized across reporters.
#[derive(Debug, Clone)]
pub struct BuildMessage {
    pub severity: Severity,
    /// Which validator reported it.
    pub source: String,
    /// Reporter-specific code like `RSC-005` or an axe rule name.
    pub code: Option<String>,
    pub text: String,
    pub file: Option<String>,
    pub line: Option<u64>,
    pub column: Option<u64>,
    /// Extra detail lines the reporter attached to the finding.
    pub submessages: Vec<String>,
}

impl fmt::Display for BuildMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: ", self.source, self.severity)?;
        if let Some(code) = &self.code {
            write!(f, "[{code}] ")?;
        }
        write!(f, "{}", self.text)?;
        if let Some(file) = &self.file {
            write!(f, " ({file}")?;
            if let Some(line) = self.line {
                write!(f, ":{line}")?;
                if let Some(column) = self.column {
                    write!(f, ":{column}")?;
                }
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

// === Tool interfaces ===

/// Rewrites a document into its canonical serialization, or reports a
/// located syntax error.
pub trait Canonicalizer {
    fn canonicalize(&self, path: &Path, text: &str) -> Result<String>;
}

/// Checks a packaged artifact or document tree and reports findings.
pub trait Validator {
    fn name(&self) -> &str;
    /// The artifact is the packaged container for `epubcheck` and `ace`,
    /// and the unpacked tree root for `vnu`.
    fn validate(&self, artifact: &Path) -> Result<Vec<BuildMessage>>;
}

/// Renders an SVG file to PNG at a pixel density.
pub trait Rasterizer {
    fn rasterize(&self, svg: &Path, png: &Path, zoom: u32) -> Result<()>;
}

/// Raster post-processing: format conversion, resizing, metadata removal.
pub trait ImageConverter {
    fn to_jpeg(&self, input: &Path, output: &Path) -> Result<()>;
    fn resize(&self, input: &Path, output: &Path, width: u32, height: u32) -> Result<()>;
    fn strip_metadata(&self, image: &Path) -> Result<()>;
}

/// Converts a finished EPUB into a Kindle artifact.
pub trait KindleConverter {
    fn convert(&self, epub: &Path, azw3: &Path, cover: &Path) -> Result<()>;
}

/// Renders a MathML fragment to a cropped, transparent PNG.
pub trait MathRasterizer {
    fn render(&self, mathml: &str, output: &Path) -> Result<()>;
}

/// Every external helper a build may need, resolved before any work
/// starts. The MathML renderer is absent here: it is probed only when a
/// document still contains MathML after simplification.
pub struct Toolbox {
    pub canonicalizer: Box<dyn Canonicalizer>,
    pub rasterizer: Box<dyn Rasterizer>,
    pub images: Box<dyn ImageConverter>,
    pub kindle: Option<Box<dyn KindleConverter>>,
    pub validators: Vec<Box<dyn Validator>>,
}

impl Toolbox {
    /// Probe every binary the requested targets need. `ebook-convert` is
    /// only required when the Kindle branch is enabled; `ace` and `vnu`
    /// are run when present and skipped with a warning when not.
    pub fn detect(with_kindle: bool) -> Result<Toolbox> {
        let canonicalizer = Xmllint::probe()?;
        let rasterizer = RsvgConvert::probe()?;
        let images = Magick::probe()?;
        let kindle = if with_kindle {
            Some(Box::new(EbookConvert::probe()?) as Box<dyn KindleConverter>)
        } else {
            None
        };

        let mut validators: Vec<Box<dyn Validator>> = vec![Box::new(Epubcheck::probe()?)];
        match Ace::probe() {
            Ok(ace) => validators.push(Box::new(ace)),
            Err(_) => warn!("ace not found; skipping accessibility checks"),
        }
        match Vnu::probe() {
            Ok(vnu) => validators.push(Box::new(vnu)),
            Err(_) => warn!("vnu not found; skipping markup checks"),
        }

        Ok(Toolbox {
            canonicalizer: Box::new(canonicalizer),
            rasterizer: Box::new(rasterizer),
            images: Box::new(images),
            kindle,
            validators,
        })
    }
}

// === xmllint ===

/// Matches the first located error on xmllint's stderr.
static XMLLINT_ERROR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[^\n:]+:(\d+):\s*(.+)$").unwrap());

/// Turn xmllint stderr into a located parse error against the real
/// document path rather than the scratch file xmllint saw.
pub(crate) fn parse_xmllint_stderr(path: &Path, stderr: &str) -> Error {
    if let Some(caps) = XMLLINT_ERROR_RE.captures(stderr) {
        Error::Parse {
            path: path.to_path_buf(),
            line: caps[1].parse().unwrap_or(0),
            col: 0,
            detail: caps[2].trim().to_string(),
        }
    } else {
        Error::Tool {
            tool: "xmllint".to_string(),
            detail: last_line(stderr),
        }
    }
}

pub struct Xmllint {
    binary: PathBuf,
}

impl Xmllint {
    pub fn probe() -> Result<Self> {
        Ok(Self {
            binary: require_binary("xmllint", &["xmllint"])?,
        })
    }
}

impl Canonicalizer for Xmllint {
    fn canonicalize(&self, path: &Path, text: &str) -> Result<String> {
        let mut scratch = tempfile::Builder::new().suffix(".xhtml").tempfile()?;
        scratch.write_all(text.as_bytes())?;
        scratch.flush()?;
        let out = run_captured(
            &self.binary,
            [
                OsStr::new("--encode"),
                OsStr::new("utf-8"),
                OsStr::new("--format"),
                scratch.path().as_os_str(),
            ],
        )?;
        if !out.success {
            return Err(parse_xmllint_stderr(path, &out.stderr));
        }
        Ok(out.stdout)
    }
}

// === rsvg-convert ===

pub struct RsvgConvert {
    binary: PathBuf,
}

impl RsvgConvert {
    pub fn probe() -> Result<Self> {
        Ok(Self {
            binary: require_binary("rsvg-convert", &["rsvg-convert"])?,
        })
    }
}

impl Rasterizer for RsvgConvert {
    fn rasterize(&self, svg: &Path, png: &Path, zoom: u32) -> Result<()> {
        let mut args: Vec<OsString> = Vec::new();
        if zoom > 1 {
            args.push("--zoom".into());
            args.push(zoom.to_string().into());
        }
        args.push("--keep-aspect-ratio".into());
        args.push("--format".into());
        args.push("png".into());
        args.push("--output".into());
        args.push(png.as_os_str().to_os_string());
        args.push(svg.as_os_str().to_os_string());
        let out = run_captured(&self.binary, args)?;
        if !out.success {
            return Err(Error::Tool {
                tool: "rsvg-convert".to_string(),
                detail: last_line(&out.stderr),
            });
        }
        Ok(())
    }
}

// === ImageMagick ===

pub struct Magick {
    binary: PathBuf,
}

impl Magick {
    pub fn probe() -> Result<Self> {
        Ok(Self {
            binary: require_binary("magick", &["magick", "convert"])?,
        })
    }

    fn run(&self, args: &[&OsStr]) -> Result<()> {
        let out = run_captured(&self.binary, args)?;
        if !out.success {
            return Err(Error::Tool {
                tool: "magick".to_string(),
                detail: last_line(&out.stderr),
            });
        }
        Ok(())
    }
}

impl ImageConverter for Magick {
    fn to_jpeg(&self, input: &Path, output: &Path) -> Result<()> {
        self.run(&[
            OsStr::new("-format"),
            OsStr::new("jpg"),
            input.as_os_str(),
            output.as_os_str(),
        ])
    }

    fn resize(&self, input: &Path, output: &Path, width: u32, height: u32) -> Result<()> {
        let geometry = format!("{width}x{height}");
        self.run(&[
            input.as_os_str(),
            OsStr::new("-resize"),
            OsStr::new(&geometry),
            output.as_os_str(),
        ])
    }

    fn strip_metadata(&self, image: &Path) -> Result<()> {
        self.run(&[image.as_os_str(), OsStr::new("-strip"), image.as_os_str()])
    }
}

// === ebook-convert ===

pub struct EbookConvert {
    binary: PathBuf,
}

impl EbookConvert {
    pub fn probe() -> Result<Self> {
        Ok(Self {
            binary: require_binary("ebook-convert", &["ebook-convert"])?,
        })
    }
}

impl KindleConverter for EbookConvert {
    fn convert(&self, epub: &Path, azw3: &Path, cover: &Path) -> Result<()> {
        let mut cover_arg = OsString::from("--cover=");
        cover_arg.push(cover);
        let out = run_captured(
            &self.binary,
            [
                epub.as_os_str(),
                azw3.as_os_str(),
                OsStr::new("--pretty-print"),
                OsStr::new("--no-inline-toc"),
                OsStr::new("--max-toc-links=0"),
                OsStr::new("--prefer-metadata-cover"),
                cover_arg.as_os_str(),
            ],
        )?;
        if !out.success {
            return Err(Error::Tool {
                tool: "ebook-convert".to_string(),
                detail: last_line(&out.stderr),
            });
        }
        Ok(())
    }
}

// === firefox (MathML fallback) ===

/// Headless-browser renderer for MathML that survives simplification.
/// The screenshot's white page background is made transparent and the
/// canvas trimmed to the glyph extents.
pub struct FirefoxMath {
    firefox: PathBuf,
    magick: PathBuf,
}

impl FirefoxMath {
    pub fn probe() -> Result<Self> {
        Ok(Self {
            firefox: require_binary("firefox", &["firefox"])?,
            magick: require_binary("magick", &["magick", "convert"])?,
        })
    }
}

impl MathRasterizer for FirefoxMath {
    fn render(&self, mathml: &str, output: &Path) -> Result<()> {
        let mut page = tempfile::Builder::new().suffix(".html").tempfile()?;
        write!(
            page,
            "<!doctype html><html><head><meta charset=\"utf-8\"/><title>MathML fragment</title></head><body>{mathml}</body></html>"
        )?;
        page.flush()?;
        let url = format!("file://{}", page.path().display());
        let shot = run_captured(
            &self.firefox,
            [
                OsStr::new("--headless"),
                OsStr::new("--screenshot"),
                output.as_os_str(),
                OsStr::new(&url),
            ],
        )?;
        if !shot.success || !output.is_file() {
            return Err(Error::Tool {
                tool: "firefox".to_string(),
                detail: last_line(&shot.stderr),
            });
        }
        let trim = run_captured(
            &self.magick,
            [
                output.as_os_str(),
                OsStr::new("-transparent"),
                OsStr::new("white"),
                OsStr::new("-trim"),
                output.as_os_str(),
            ],
        )?;
        if !trim.success {
            return Err(Error::Tool {
                tool: "magick".to_string(),
                detail: last_line(&trim.stderr),
            });
        }
        Ok(())
    }
}

// === epubcheck ===

#[derive(Deserialize)]
struct EpubcheckReport {
    #[serde(default)]
    messages: Vec<EpubcheckMessage>,
}

#[derive(Deserialize)]
struct EpubcheckMessage {
    #[serde(rename = "ID")]
    id: String,
    severity: String,
    message: String,
    #[serde(default)]
    locations: Vec<EpubcheckLocation>,
}

#[derive(Deserialize)]
struct EpubcheckLocation {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    line: i64,
    #[serde(default)]
    column: i64,
}

/// Read an epubcheck JSON report, keeping warnings and worse. Usage and
/// info entries are advisory and do not fail a build.
pub(crate) fn parse_epubcheck_report(json: &str) -> Result<Vec<BuildMessage>> {
    let report: EpubcheckReport = serde_json::from_str(json).map_err(|err| Error::Tool {
        tool: "epubcheck".to_string(),
        detail: format!("unreadable report: {err}"),
    })?;
    let mut findings = Vec::new();
    for message in report.messages {
        let severity = match message.severity.as_str() {
            "FATAL" => Severity::Fatal,
            "ERROR" => Severity::Error,
            "WARNING" => Severity::Warning,
            _ => continue,
        };
        let location = message.locations.first();
        findings.push(BuildMessage {
            severity,
            source: "epubcheck".to_string(),
            code: Some(message.id),
            text: message.message,
            file: location.and_then(|loc| loc.path.clone()),
            line: location.and_then(|loc| u64::try_from(loc.line).ok()),
            column: location.and_then(|loc| u64::try_from(loc.column).ok()),
            submessages: Vec::new(),
        });
    }
    Ok(findings)
}

pub struct Epubcheck {
    binary: PathBuf,
}

impl Epubcheck {
    pub fn probe() -> Result<Self> {
        Ok(Self {
            binary: require_binary("epubcheck", &["epubcheck"])?,
        })
    }
}

impl Validator for Epubcheck {
    fn name(&self) -> &str {
        "epubcheck"
    }

    fn validate(&self, artifact: &Path) -> Result<Vec<BuildMessage>> {
        let report = tempfile::Builder::new().suffix(".json").tempfile()?;
        let out = run_captured(
            &self.binary,
            [
                OsStr::new("--quiet"),
                OsStr::new("--json"),
                report.path().as_os_str(),
                artifact.as_os_str(),
            ],
        )?;
        let json = std::fs::read_to_string(report.path())?;
        if json.trim().is_empty() {
            return Err(Error::Tool {
                tool: "epubcheck".to_string(),
                detail: last_line(&out.stderr),
            });
        }
        parse_epubcheck_report(&json)
    }
}

// === ace ===

#[derive(Deserialize)]
struct AceReport {
    #[serde(default)]
    assertions: Vec<AceDocumentAssertion>,
}

#[derive(Deserialize)]
struct AceDocumentAssertion {
    #[serde(rename = "earl:testSubject", default)]
    subject: Option<AceSubject>,
    #[serde(default)]
    assertions: Vec<AceAssertion>,
}

#[derive(Deserialize)]
struct AceSubject {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize)]
struct AceAssertion {
    #[serde(rename = "earl:test")]
    test: AceTest,
    #[serde(rename = "earl:result")]
    result: AceResult,
}

#[derive(Deserialize)]
struct AceTest {
    #[serde(rename = "earl:impact", default)]
    impact: Option<String>,
    #[serde(rename = "dct:title", default)]
    title: Option<String>,
    #[serde(rename = "dct:description", default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct AceResult {
    #[serde(rename = "earl:outcome", default)]
    outcome: Option<String>,
    #[serde(rename = "dct:description", default)]
    description: Option<String>,
    #[serde(rename = "earl:pointer", default)]
    pointer: Option<AcePointer>,
}

#[derive(Deserialize)]
struct AcePointer {
    #[serde(default)]
    css: Vec<String>,
}

/// Read an ace EARL report, keeping failed assertions.
pub(crate) fn parse_ace_report(json: &str) -> Result<Vec<BuildMessage>> {
    let report: AceReport = serde_json::from_str(json).map_err(|err| Error::Tool {
        tool: "ace".to_string(),
        detail: format!("unreadable report: {err}"),
    })?;
    let mut findings = Vec::new();
    for document in report.assertions {
        let file = document.subject.and_then(|subject| subject.url);
        for assertion in document.assertions {
            if assertion.result.outcome.as_deref() != Some("fail") {
                continue;
            }
            let severity = match assertion.test.impact.as_deref() {
                Some("minor") | Some("moderate") => Severity::Warning,
                _ => Severity::Error,
            };
            let mut submessages = Vec::new();
            if let Some(detail) = assertion.result.description {
                submessages.push(detail);
            }
            if let Some(pointer) = assertion.result.pointer {
                submessages.extend(pointer.css);
            }
            findings.push(BuildMessage {
                severity,
                source: "ace".to_string(),
                code: assertion.test.title,
                text: assertion
                    .test
                    .description
                    .unwrap_or_else(|| "accessibility check failed".to_string()),
                file: file.clone(),
                line: None,
                column: None,
                submessages,
            });
        }
    }
    Ok(findings)
}

pub struct Ace {
    binary: PathBuf,
}

impl Ace {
    pub fn probe() -> Result<Self> {
        Ok(Self {
            binary: require_binary("ace", &["ace"])?,
        })
    }
}

impl Validator for Ace {
    fn name(&self) -> &str {
        "ace"
    }

    fn validate(&self, artifact: &Path) -> Result<Vec<BuildMessage>> {
        let outdir = tempfile::tempdir()?;
        let out = run_captured(
            &self.binary,
            [
                OsStr::new("--outdir"),
                outdir.path().as_os_str(),
                artifact.as_os_str(),
            ],
        )?;
        let report_path = outdir.path().join("report.json");
        if !report_path.is_file() {
            return Err(Error::Tool {
                tool: "ace".to_string(),
                detail: last_line(&out.stderr),
            });
        }
        let json = std::fs::read_to_string(report_path)?;
        parse_ace_report(&json)
    }
}

// === vnu ===

#[derive(Deserialize)]
struct VnuReport {
    #[serde(default)]
    messages: Vec<VnuMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VnuMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    sub_type: Option<String>,
    message: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    last_line: Option<u64>,
    #[serde(default)]
    first_column: Option<u64>,
    #[serde(default)]
    last_column: Option<u64>,
    #[serde(default)]
    extract: Option<String>,
}

/// Read a vnu JSON report, keeping errors and warnings.
pub(crate) fn parse_vnu_report(json: &str) -> Result<Vec<BuildMessage>> {
    let report: VnuReport = serde_json::from_str(json).map_err(|err| Error::Tool {
        tool: "vnu".to_string(),
        detail: format!("unreadable report: {err}"),
    })?;
    let mut findings = Vec::new();
    for message in report.messages {
        let severity = match (message.kind.as_str(), message.sub_type.as_deref()) {
            ("error", _) | ("non-document-error", _) => Severity::Error,
            ("info", Some("warning")) => Severity::Warning,
            _ => continue,
        };
        let submessages = message.extract.into_iter().collect();
        findings.push(BuildMessage {
            severity,
            source: "vnu".to_string(),
            code: None,
            text: message.message,
            file: message.url,
            line: message.last_line,
            column: message.first_column.or(message.last_column),
            submessages,
        });
    }
    Ok(findings)
}

pub struct Vnu {
    binary: PathBuf,
}

impl Vnu {
    pub fn probe() -> Result<Self> {
        Ok(Self {
            binary: require_binary("vnu", &["vnu"])?,
        })
    }
}

impl Validator for Vnu {
    fn name(&self) -> &str {
        "vnu"
    }

    fn validate(&self, artifact: &Path) -> Result<Vec<BuildMessage>> {
        // vnu emits its JSON report on stderr and exits nonzero when it
        // finds anything, so the exit status alone is not an error.
        let out = run_captured(
            &self.binary,
            [
                OsStr::new("--format"),
                OsStr::new("json"),
                OsStr::new("--skip-non-html"),
                artifact.as_os_str(),
            ],
        )?;
        if out.stderr.trim().is_empty() {
            return Ok(Vec::new());
        }
        parse_vnu_report(&out.stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_binary(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    #[test]
    fn test_candidate_order_outranks_directory_order() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        fake_binary(first.path(), "convert");
        let magick = fake_binary(second.path(), "magick");
        let path_var =
            std::env::join_paths([first.path(), second.path()].iter()).unwrap();
        assert_eq!(
            search_path(&path_var, &["magick", "convert"]),
            Some(magick)
        );
        assert_eq!(search_path(&path_var, &["no-such-tool"]), None);
    }

    #[test]
    fn test_epubcheck_report_keeps_warnings_and_worse() {
        let json = r#"{
            "messages": [
                {
                    "ID": "RSC-005",
                    "severity": "ERROR",
                    "message": "Error while parsing file: element \"xyz\" not allowed here",
                    "locations": [{"path": "epub/text/chapter-1.xhtml", "line": 12, "column": 4}]
                },
                {
                    "ID": "OPF-060",
                    "severity": "USAGE",
                    "message": "Duplicate entry",
                    "locations": []
                },
                {
                    "ID": "ACC-013",
                    "severity": "WARNING",
                    "message": "Content Documents do not use 'epub:type' attributes",
                    "locations": [{"path": "epub/text/uncopyright.xhtml", "line": -1, "column": -1}]
                }
            ]
        }"#;
        let findings = parse_epubcheck_report(json).unwrap();
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].severity, Severity::Error);
        assert_eq!(findings[0].code.as_deref(), Some("RSC-005"));
        assert_eq!(findings[0].file.as_deref(), Some("epub/text/chapter-1.xhtml"));
        assert_eq!(findings[0].line, Some(12));
        // Negative locations mean "unknown" and are dropped.
        assert_eq!(findings[1].line, None);
    }

    #[test]
    fn test_ace_report_keeps_failed_assertions() {
        let json = r#"{
            "assertions": [
                {
                    "earl:testSubject": {"url": "text/titlepage.xhtml"},
                    "assertions": [
                        {
                            "earl:test": {
                                "earl:impact": "serious",
                                "dct:title": "image-alt",
                                "dct:description": "Images must have alternate text"
                            },
                            "earl:result": {
                                "earl:outcome": "fail",
                                "earl:pointer": {"css": ["img:nth-child(1)"]},
                                "dct:description": "Fix any of the following: Element does not have an alt attribute"
                            }
                        },
                        {
                            "earl:test": {"dct:title": "document-title"},
                            "earl:result": {"earl:outcome": "pass"}
                        }
                    ]
                }
            ]
        }"#;
        let findings = parse_ace_report(json).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Error);
        assert_eq!(findings[0].code.as_deref(), Some("image-alt"));
        assert_eq!(findings[0].file.as_deref(), Some("text/titlepage.xhtml"));
        assert_eq!(findings[0].submessages.len(), 2);
    }

    #[test]
    fn test_vnu_report_maps_types() {
        let json = r#"{
            "messages": [
                {"type": "error", "url": "file:/work/epub/text/chapter-1.xhtml", "lastLine": 7, "firstColumn": 3, "lastColumn": 9, "message": "Unclosed element p.", "extract": "<p>text"},
                {"type": "info", "subType": "warning", "message": "Section lacks heading."},
                {"type": "info", "message": "Using the schema for XHTML."}
            ]
        }"#;
        let findings = parse_vnu_report(json).unwrap();
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].severity, Severity::Error);
        assert_eq!(findings[0].line, Some(7));
        assert_eq!(findings[0].column, Some(3));
        assert_eq!(findings[0].submessages, vec!["<p>text".to_string()]);
        assert_eq!(findings[1].severity, Severity::Warning);
    }

    #[test]
    fn test_xmllint_stderr_becomes_located_error() {
        let stderr = "/tmp/.tmpa1b2c3.xhtml:5: parser error : Opening and ending tag mismatch: b line 4 and p\n  <p>text</b></p>\n            ^\n";
        let err = parse_xmllint_stderr(Path::new("src/epub/text/chapter-1.xhtml"), stderr);
        match err {
            Error::Parse { path, line, detail, .. } => {
                assert_eq!(path, PathBuf::from("src/epub/text/chapter-1.xhtml"));
                assert_eq!(line, 5);
                assert!(detail.contains("tag mismatch"));
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_finding_formats_one_line() {
        let message = BuildMessage {
            severity: Severity::Error,
            source: "epubcheck".to_string(),
            code: Some("RSC-005".to_string()),
            text: "element \"xyz\" not allowed here".to_string(),
            file: Some("epub/text/chapter-1.xhtml".to_string()),
            line: Some(12),
            column: Some(4),
            submessages: Vec::new(),
        };
        assert_eq!(
            message.to_string(),
            "epubcheck: error: [RSC-005] element \"xyz\" not allowed here (epub/text/chapter-1.xhtml:12:4)"
        );
    }

    #[test]
    fn test_captured_run_reports_streams() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("talk");
        fs::write(&script, "#!/bin/sh\necho out\necho err >&2\nexit 3\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        }
        let out = run_captured(&script, std::iter::empty::<&OsStr>()).unwrap();
        assert!(!out.success);
        assert_eq!(out.stdout, "out\n");
        assert_eq!(last_line(&out.stderr), "err");
    }
}
