//! End-to-end pipeline tests against a generated fixture publication,
//! with every external tool stubbed out.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use bindery::build::{build, compatible_stage, BuildOptions};
use bindery::store::SourceTree;
use bindery::tools::{
    BuildMessage, Canonicalizer, ImageConverter, KindleConverter, Rasterizer, Severity, Toolbox,
    Validator,
};
use bindery::{mobi, Error, Result};

// sha1("https://example.com/ebooks/jane-author/the-test-book")
const FIXTURE_ASIN: &str = "bc83b955312be7454b56b417bbe8af1ba9ea4124";

// === Fixture publication ===

fn svg(name: &str) -> String {
    format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n",
            "<svg xmlns=\"http://www.w3.org/2000/svg\" height=\"100\" width=\"100\">\n",
            "\t<title>{}</title>\n",
            "\t<path d=\"M 0 0 L 10 10\"/>\n",
            "</svg>\n"
        ),
        name
    )
}

fn xhtml_doc(title: &str, body: &str) -> String {
    format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n",
            "<html xmlns=\"http://www.w3.org/1999/xhtml\" ",
            "xmlns:epub=\"http://www.idpf.org/2007/ops\" xml:lang=\"en-US\">\n",
            "<head>\n\t<title>{}</title>\n",
            "\t<link href=\"../css/core.css\" rel=\"stylesheet\" type=\"text/css\"/>\n",
            "</head>\n",
            "<body>\n{}</body>\n",
            "</html>\n"
        ),
        title, body
    )
}

fn write_fixture(root: &Path, notes: usize) {
    let w = |rel: &str, text: String| {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, text).unwrap();
    };

    w(
        "META-INF/container.xml",
        concat!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n",
            "<container xmlns=\"urn:oasis:names:tc:opendocument:xmlns:container\" version=\"1.0\">\n",
            "\t<rootfiles>\n",
            "\t\t<rootfile full-path=\"epub/content.opf\" media-type=\"application/oebps-package+xml\"/>\n",
            "\t</rootfiles>\n",
            "</container>\n"
        )
        .to_string(),
    );

    w(
        "epub/content.opf",
        concat!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n",
            "<package xmlns=\"http://www.idpf.org/2007/opf\" dir=\"ltr\" unique-identifier=\"uid\" version=\"3.0\" xml:lang=\"en-US\">\n",
            "\t<metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\">\n",
            "\t\t<dc:identifier id=\"uid\">url:https://example.com/ebooks/jane-author/the-test-book</dc:identifier>\n",
            "\t\t<dc:title id=\"title\">The Test Book</dc:title>\n",
            "\t\t<dc:language>en-US</dc:language>\n",
            "\t\t<meta property=\"dcterms:modified\">1900-01-01T00:00:00Z</meta>\n",
            "\t\t<dc:creator id=\"author\">Jane Author</dc:creator>\n",
            "\t\t<dc:publisher id=\"publisher\">Example Press</dc:publisher>\n",
            "\t</metadata>\n",
            "\t<manifest>\n",
            "\t\t<item href=\"css/core.css\" id=\"core.css\" media-type=\"text/css\"/>\n",
            "\t\t<item href=\"images/cover.svg\" id=\"cover.svg\" media-type=\"image/svg+xml\" properties=\"cover-image\"/>\n",
            "\t\t<item href=\"images/logo.svg\" id=\"logo.svg\" media-type=\"image/svg+xml\"/>\n",
            "\t\t<item href=\"images/titlepage.svg\" id=\"titlepage.svg\" media-type=\"image/svg+xml\"/>\n",
            "\t\t<item href=\"toc.xhtml\" id=\"toc.xhtml\" media-type=\"application/xhtml+xml\" properties=\"nav\"/>\n",
            "\t\t<item href=\"text/chapter-1.xhtml\" id=\"chapter-1.xhtml\" media-type=\"application/xhtml+xml\"/>\n",
            "\t\t<item href=\"text/colophon.xhtml\" id=\"colophon.xhtml\" media-type=\"application/xhtml+xml\"/>\n",
            "\t\t<item href=\"text/endnotes.xhtml\" id=\"endnotes.xhtml\" media-type=\"application/xhtml+xml\"/>\n",
            "\t\t<item href=\"text/titlepage.xhtml\" id=\"titlepage.xhtml\" media-type=\"application/xhtml+xml\"/>\n",
            "\t</manifest>\n",
            "\t<spine>\n",
            "\t\t<itemref idref=\"titlepage.xhtml\"/>\n",
            "\t\t<itemref idref=\"chapter-1.xhtml\"/>\n",
            "\t\t<itemref idref=\"endnotes.xhtml\"/>\n",
            "\t\t<itemref idref=\"colophon.xhtml\"/>\n",
            "\t</spine>\n",
            "</package>\n"
        )
        .to_string(),
    );

    w(
        "epub/toc.xhtml",
        xhtml_doc(
            "Table of Contents",
            concat!(
                "\t<nav epub:type=\"toc\">\n",
                "\t\t<h2>Table of Contents</h2>\n",
                "\t\t<ol>\n",
                "\t\t\t<li><a href=\"text/titlepage.xhtml\">Titlepage</a></li>\n",
                "\t\t\t<li><a href=\"text/chapter-1.xhtml\">Chapter 1</a></li>\n",
                "\t\t\t<li><a href=\"text/endnotes.xhtml\">Endnotes</a></li>\n",
                "\t\t\t<li><a href=\"text/colophon.xhtml\">Colophon</a></li>\n",
                "\t\t</ol>\n",
                "\t</nav>\n",
                "\t<nav epub:type=\"landmarks\" hidden=\"hidden\">\n",
                "\t\t<ol>\n",
                "\t\t\t<li><a href=\"text/titlepage.xhtml\" epub:type=\"frontmatter titlepage\">Titlepage</a></li>\n",
                "\t\t\t<li><a href=\"text/chapter-1.xhtml\" epub:type=\"bodymatter\">Text</a></li>\n",
                "\t\t\t<li><a href=\"text/colophon.xhtml\" epub:type=\"backmatter colophon\">Colophon</a></li>\n",
                "\t\t</ol>\n",
                "\t</nav>\n"
            ),
        ),
    );

    w(
        "epub/css/core.css",
        concat!(
            "abbr{\n\tfont-variant: all-small-caps;\n}\n\n",
            "p:first-child{\n\ttext-indent: 0;\n}\n\n",
            "li[epub|type~=\"endnote\"]{\n\tmargin: 1em 0;\n}\n\n",
            "blockquote{\n\thyphens: none;\n\tpage-break-inside: avoid;\n}\n"
        )
        .to_string(),
    );

    w(
        "epub/text/titlepage.xhtml",
        xhtml_doc(
            "Titlepage",
            concat!(
                "\t<section epub:type=\"titlepage\">\n",
                "\t\t<img alt=\"The Test Book\" src=\"../images/titlepage.svg\"/>\n",
                "\t</section>\n"
            ),
        ),
    );

    let mut chapter = String::from("\t<section id=\"chapter-1\" epub:type=\"chapter\">\n");
    for i in 1..=notes {
        chapter.push_str(&format!(
            "\t\t<p>Passage {i}.<a href=\"endnotes.xhtml#note-{i}\" id=\"noteref-{i}\" epub:type=\"noteref\">{i}</a></p>\n"
        ));
    }
    chapter.push_str("\t</section>\n");
    w("epub/text/chapter-1.xhtml", xhtml_doc("Chapter 1", &chapter));

    let mut endnotes = String::from(
        "\t<section id=\"endnotes\" epub:type=\"backmatter endnotes\">\n\t\t<h2>Endnotes</h2>\n\t\t<ol>\n",
    );
    for i in 1..=notes {
        endnotes.push_str(&format!(
            "\t\t\t<li id=\"note-{i}\" epub:type=\"endnote\">\n\t\t\t\t<p>Note {i}. <a href=\"chapter-1.xhtml#noteref-{i}\" epub:type=\"se:referrer\">\u{21a9}</a></p>\n\t\t\t</li>\n"
        ));
    }
    endnotes.push_str("\t\t</ol>\n\t</section>\n");
    w("epub/text/endnotes.xhtml", xhtml_doc("Endnotes", &endnotes));

    w(
        "epub/text/colophon.xhtml",
        xhtml_doc(
            "Colophon",
            concat!(
                "\t<section epub:type=\"colophon\">\n",
                "\t\t<p>The first edition of this ebook was released on<br/>\n",
                "\t\t\t<b>January 1, 1900</b>.</p>\n",
                "\t</section>\n"
            ),
        ),
    );

    w("epub/images/cover.svg", svg("Cover"));
    w("epub/images/logo.svg", svg("Logo"));
    w("epub/images/titlepage.svg", svg("The Test Book"));
}

// === Stub tools ===

struct PassCanonicalizer;

impl Canonicalizer for PassCanonicalizer {
    fn canonicalize(&self, _path: &Path, text: &str) -> Result<String> {
        Ok(text.to_string())
    }
}

struct StubRasterizer;

impl Rasterizer for StubRasterizer {
    fn rasterize(&self, _svg: &Path, png: &Path, _zoom: u32) -> Result<()> {
        fs::write(png, b"\x89PNG stub")?;
        Ok(())
    }
}

struct StubImages;

impl ImageConverter for StubImages {
    fn to_jpeg(&self, input: &Path, output: &Path) -> Result<()> {
        fs::copy(input, output)?;
        Ok(())
    }

    fn resize(&self, input: &Path, output: &Path, _width: u32, _height: u32) -> Result<()> {
        fs::copy(input, output)?;
        Ok(())
    }

    fn strip_metadata(&self, _image: &Path) -> Result<()> {
        Ok(())
    }
}

/// Writes a synthetic but structurally valid AZW3 so the ASIN patch step
/// has something real to edit.
struct StubKindle;

impl KindleConverter for StubKindle {
    fn convert(&self, _epub: &Path, azw3: &Path, cover: &Path) -> Result<()> {
        assert!(cover.is_file(), "converter got a missing cover");
        fs::write(azw3, synthetic_azw3())?;
        Ok(())
    }
}

const MOBI_HEADER_LEN: usize = 232;

fn synthetic_record0(records: &[(u32, &[u8])], tail_pad: usize) -> Vec<u8> {
    let mut exth_content = Vec::new();
    for (rec_type, payload) in records {
        exth_content.extend_from_slice(&rec_type.to_be_bytes());
        exth_content.extend_from_slice(&((8 + payload.len()) as u32).to_be_bytes());
        exth_content.extend_from_slice(payload);
    }
    let exth_len = 12 + exth_content.len();

    let title = b"The Test Book";
    let title_offset = 16 + MOBI_HEADER_LEN + exth_len;

    let mut record0 = vec![0u8; 16];
    record0[0..2].copy_from_slice(&2u16.to_be_bytes());

    let mut header = vec![0u8; MOBI_HEADER_LEN];
    header[0..4].copy_from_slice(b"MOBI");
    header[4..8].copy_from_slice(&(MOBI_HEADER_LEN as u32).to_be_bytes());
    header[68..72].copy_from_slice(&(title_offset as u32).to_be_bytes());
    header[72..76].copy_from_slice(&(title.len() as u32).to_be_bytes());
    record0.extend_from_slice(&header);

    record0.extend_from_slice(b"EXTH");
    record0.extend_from_slice(&(exth_len as u32).to_be_bytes());
    record0.extend_from_slice(&(records.len() as u32).to_be_bytes());
    record0.extend_from_slice(&exth_content);

    record0.extend_from_slice(title);
    record0.resize(record0.len() + tail_pad, 0);
    record0
}

fn synthetic_azw3() -> Vec<u8> {
    let record0 = synthetic_record0(
        &[
            (100, b"Jane Author"),
            (mobi::EXTH_ASIN, b"B000000000"),
            (mobi::EXTH_CDE_TYPE, b"PDOC"),
        ],
        256,
    );
    let records = [record0, b"text record".to_vec(), b"FLIS".to_vec()];

    let mut data = vec![0u8; 60];
    data[..13].copy_from_slice(b"The Test Book");
    data.extend_from_slice(b"BOOKMOBI");
    data.extend_from_slice(&0u32.to_be_bytes());
    data.extend_from_slice(&0u32.to_be_bytes());
    data.extend_from_slice(&(records.len() as u16).to_be_bytes());
    let mut offset = 78 + 8 * records.len() + 2;
    for (i, record) in records.iter().enumerate() {
        data.extend_from_slice(&(offset as u32).to_be_bytes());
        data.push(0);
        data.extend_from_slice(&[0, 0, i as u8]);
        offset += record.len();
    }
    data.extend_from_slice(&[0, 0]);
    for record in &records {
        data.extend_from_slice(record);
    }
    data
}

struct StubValidator {
    name: &'static str,
    messages: Vec<BuildMessage>,
}

impl Validator for StubValidator {
    fn name(&self) -> &str {
        self.name
    }

    fn validate(&self, artifact: &Path) -> Result<Vec<BuildMessage>> {
        assert!(artifact.exists(), "validator got a missing artifact");
        Ok(self.messages.clone())
    }
}

fn stub_toolbox(with_kindle: bool, messages: Vec<BuildMessage>) -> Toolbox {
    Toolbox {
        canonicalizer: Box::new(PassCanonicalizer),
        rasterizer: Box::new(StubRasterizer),
        images: Box::new(StubImages),
        kindle: if with_kindle {
            Some(Box::new(StubKindle))
        } else {
            None
        },
        validators: vec![Box::new(StubValidator {
            name: "epubcheck",
            messages,
        })],
    }
}

fn finding() -> BuildMessage {
    BuildMessage {
        severity: Severity::Error,
        source: "epubcheck".to_string(),
        code: Some("RSC-005".to_string()),
        text: "fixture finding".to_string(),
        file: Some("epub/content.opf".to_string()),
        line: Some(3),
        column: None,
        submessages: Vec::new(),
    }
}

fn zip_entry(archive: &Path, name: &str) -> Option<String> {
    let file = fs::File::open(archive).unwrap();
    let mut zip = zip::ZipArchive::new(file).unwrap();
    let mut entry = match zip.by_name(name) {
        Ok(entry) => entry,
        Err(_) => return None,
    };
    let mut text = String::new();
    entry.read_to_string(&mut text).unwrap();
    Some(text)
}

fn options(source: &Path, output: &Path) -> BuildOptions {
    BuildOptions {
        source_dir: source.to_path_buf(),
        output_dir: output.to_path_buf(),
        kobo: false,
        kindle: false,
        check_only: false,
    }
}

// === Tests ===

#[test]
fn full_build_produces_every_artifact() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("book");
    let output = dir.path().join("dist");
    write_fixture(&source, 600);

    let mut opts = options(&source, &output);
    opts.kobo = true;
    opts.kindle = true;
    let tools = stub_toolbox(true, Vec::new());

    let outcome = build(&opts, &tools).unwrap();
    assert!(outcome.messages.is_empty());
    assert_eq!(outcome.artifacts.len(), 5);

    let thumbnail = format!("thumbnail_{FIXTURE_ASIN}_EBOK_portrait.jpg");
    for name in [
        "jane-author_the-test-book_advanced.epub",
        "jane-author_the-test-book.epub",
        "jane-author_the-test-book.kepub.epub",
        "jane-author_the-test-book.azw3",
        thumbnail.as_str(),
    ] {
        assert!(output.join(name).is_file(), "missing artifact {name}");
    }
}

#[test]
fn compatible_epub_is_chunked_and_reference_closed() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("book");
    let output = dir.path().join("dist");
    write_fixture(&source, 600);

    let tools = stub_toolbox(false, Vec::new());
    build(&options(&source, &output), &tools).unwrap();

    let compatible = output.join("jane-author_the-test-book.epub");

    // OCF: mimetype is the first entry and uncompressed.
    let file = fs::File::open(&compatible).unwrap();
    let mut zip = zip::ZipArchive::new(file).unwrap();
    let first = zip.by_index(0).unwrap();
    assert_eq!(first.name(), "mimetype");
    assert_eq!(first.compression(), zip::CompressionMethod::Stored);
    drop(first);

    // 600 notes split into two chunks; the original file is gone.
    assert!(zip_entry(&compatible, "epub/text/endnotes.xhtml").is_none());
    let chunk1 = zip_entry(&compatible, "epub/text/endnotes-1.xhtml").unwrap();
    let chunk2 = zip_entry(&compatible, "epub/text/endnotes-2.xhtml").unwrap();
    assert!(chunk1.contains("id=\"note-1\""));
    assert!(chunk1.contains("id=\"note-500\""));
    assert!(chunk2.contains("id=\"note-501\""));
    assert!(chunk2.contains("id=\"note-600\""));

    // Inbound references follow their notes into the right chunk.
    let chapter = zip_entry(&compatible, "epub/text/chapter-1.xhtml").unwrap();
    assert!(chapter.contains("href=\"endnotes-1.xhtml#note-1\""));
    assert!(chapter.contains("href=\"endnotes-2.xhtml#note-501\""));
    assert!(!chapter.contains("href=\"endnotes.xhtml#"));

    // Notes carry the popup spellings and ARIA mirrors.
    assert!(chunk1.contains("epub:type=\"footnote rearnote\""));
    assert!(chunk1.contains("role=\"doc-endnote\""));

    // Vector art became raster art.
    let opf = zip_entry(&compatible, "epub/content.opf").unwrap();
    assert!(!opf.contains("image/svg+xml"));
    assert!(opf.contains("href=\"images/cover.jpg\""));
    assert!(zip_entry(&compatible, "epub/images/titlepage.png").is_some());
    assert!(zip_entry(&compatible, "epub/images/titlepage.svg").is_none());

    // EPUB 2 fallbacks: NCX, guide, spine wiring, cover meta.
    let ncx = zip_entry(&compatible, "epub/toc.ncx").unwrap();
    assert!(ncx.contains("<navMap id=\"navmap\">"));
    assert!(ncx.contains("<navPoint id=\"navpoint-1\" playOrder=\"1\">"));
    assert!(opf.contains("<spine toc=\"ncx\">"));
    assert!(opf.contains("<guide>"));
    assert!(opf.contains("type=\"title-page text\""));
    assert!(opf.contains("name=\"cover\""));
    assert!(opf.contains("<meta property=\"se:transform\">compatibility</meta>"));

    // The release was stamped.
    assert!(!opf.contains("1900-01-01T00:00:00Z"));
    let colophon = zip_entry(&compatible, "epub/text/colophon.xhtml").unwrap();
    assert!(colophon.contains("This edition was released on"));
}

#[test]
fn kepub_is_segmented_with_notes_in_flow() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("book");
    let output = dir.path().join("dist");
    write_fixture(&source, 3);

    let mut opts = options(&source, &output);
    opts.kobo = true;
    let tools = stub_toolbox(false, Vec::new());
    build(&opts, &tools).unwrap();

    let kepub = output.join("jane-author_the-test-book.kepub.epub");
    let chapter = zip_entry(&kepub, "epub/text/chapter-1.xhtml").unwrap();
    assert!(chapter.contains("class=\"koboSpan\""));
    assert!(chapter.contains("id=\"kobo.1.1\""));

    // The popup rename is reversed and the referrer glyph swapped.
    let endnotes = zip_entry(&kepub, "epub/text/endnotes.xhtml").unwrap();
    assert!(endnotes.contains("epub:type=\"endnote\""));
    assert!(!endnotes.contains("footnote"));
    assert!(endnotes.contains("\u{ab}"));

    // The ToC keeps its native markup.
    let toc = zip_entry(&kepub, "epub/toc.xhtml").unwrap();
    assert!(!toc.contains("koboSpan"));

    let opf = zip_entry(&kepub, "epub/content.opf").unwrap();
    assert!(opf.contains("<meta property=\"se:transform\">kobo</meta>"));
}

#[test]
fn azw3_carries_the_derived_asin() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("book");
    let output = dir.path().join("dist");
    write_fixture(&source, 3);

    let mut opts = options(&source, &output);
    opts.kindle = true;
    let tools = stub_toolbox(true, Vec::new());
    build(&opts, &tools).unwrap();

    let data = fs::read(output.join("jane-author_the-test-book.azw3")).unwrap();
    let original = synthetic_azw3();
    assert_eq!(data.len(), original.len());

    let pdb = mobi::PdbContainer::parse(data).unwrap();
    let record0 = mobi::Record0::new(pdb.record(0).unwrap()).unwrap();
    let records = record0.records().unwrap();
    let payload = |t: u32| -> Vec<Vec<u8>> {
        records
            .iter()
            .filter(|r| r.rec_type == t)
            .map(|r| r.payload.clone())
            .collect()
    };
    assert_eq!(payload(mobi::EXTH_ASIN), vec![FIXTURE_ASIN.as_bytes().to_vec()]);
    assert_eq!(
        payload(mobi::EXTH_ASIN_ALT),
        vec![FIXTURE_ASIN.as_bytes().to_vec()]
    );
    assert_eq!(payload(mobi::EXTH_CDE_TYPE), vec![b"EBOK".to_vec()]);
}

#[test]
fn dangling_note_reference_is_fatal() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("book");
    let output = dir.path().join("dist");
    write_fixture(&source, 600);

    // Reference a note that no chunk will hold.
    let chapter = source.join("epub/text/chapter-1.xhtml");
    let text = fs::read_to_string(&chapter).unwrap();
    let text = text.replace(
        "</section>",
        "<p>Ghost.<a href=\"endnotes.xhtml#note-9999\" id=\"noteref-9999\" epub:type=\"noteref\">x</a></p></section>",
    );
    fs::write(&chapter, text).unwrap();

    let tools = stub_toolbox(false, Vec::new());
    let err = build(&options(&source, &output), &tools).unwrap_err();
    match err {
        Error::DanglingReference { id, .. } => assert_eq!(id, "note-9999"),
        other => panic!("expected DanglingReference, got {other}"),
    }
    assert!(!output.join("jane-author_the-test-book.epub").exists());
}

#[test]
fn validator_findings_block_artifacts() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("book");
    let output = dir.path().join("dist");
    write_fixture(&source, 3);

    let tools = stub_toolbox(false, vec![finding()]);
    let outcome = build(&options(&source, &output), &tools).unwrap();

    assert_eq!(outcome.messages.len(), 1);
    assert!(outcome.artifacts.is_empty());
    assert!(!output.join("jane-author_the-test-book.epub").exists());
    assert!(!output.join("jane-author_the-test-book_advanced.epub").exists());
    assert_eq!(
        outcome.messages[0].to_string(),
        "epubcheck: error: [RSC-005] fixture finding (epub/content.opf:3)"
    );
}

#[test]
fn check_mode_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("book");
    let output = dir.path().join("dist");
    write_fixture(&source, 3);

    let mut opts = options(&source, &output);
    opts.check_only = true;
    let tools = stub_toolbox(false, Vec::new());
    let outcome = build(&opts, &tools).unwrap();

    assert!(outcome.messages.is_empty());
    assert!(outcome.artifacts.is_empty());
    assert_eq!(fs::read_dir(&output).unwrap().count(), 0);
    // The source tree itself is untouched.
    assert!(source.join("epub/images/cover.svg").is_file());
    let opf = fs::read_to_string(source.join("epub/content.opf")).unwrap();
    assert!(opf.contains("1900-01-01T00:00:00Z"));
}

#[test]
fn compatible_stage_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let work = dir.path().join("work");
    write_fixture(&work, 12);

    let tools = stub_toolbox(false, Vec::new());

    let snapshot = |root: &Path| -> Vec<(PathBuf, String)> {
        let mut docs = Vec::new();
        for entry in fs::read_dir(root.join("epub/text")).unwrap() {
            let path = entry.unwrap().path();
            docs.push((path.clone(), fs::read_to_string(&path).unwrap()));
        }
        docs.push((
            root.join("epub/css/core.css"),
            fs::read_to_string(root.join("epub/css/core.css")).unwrap(),
        ));
        docs.sort();
        docs
    };

    let mut tree = SourceTree::open(&work).unwrap();
    compatible_stage(&mut tree, &tools).unwrap();
    tree.save_all().unwrap();
    let first = snapshot(&work);

    let mut tree = SourceTree::open(&work).unwrap();
    compatible_stage(&mut tree, &tools).unwrap();
    tree.save_all().unwrap();
    let second = snapshot(&work);

    for ((path, a), (_, b)) in first.iter().zip(second.iter()) {
        assert_eq!(a, b, "second pass changed {}", path.display());
    }
}
