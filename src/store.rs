//! Build-scoped source tree: every loaded document, parsed at most once.
//!
//! A [`SourceTree`] owns the scratch copy of the publication for exactly one
//! build. Documents are edited both as strings (regex passes) and as DOM
//! trees (structural passes); each [`Document`] tracks which representation
//! is current and resyncs before handing either out, so interleaved passes
//! cannot observe stale content.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::dom::{self, Dom};
use crate::error::{Error, Result};

/// Which representation holds the latest edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rep {
    Text,
    Tree,
}

/// One source document in two representations.
pub struct Document {
    /// Path relative to the tree root, used for error context.
    rel: PathBuf,
    text: String,
    tree: Option<Dom>,
    current: Rep,
    /// Differs from the bytes on disk.
    dirty: bool,
}

impl Document {
    fn from_text(rel: PathBuf, text: String, dirty: bool) -> Self {
        Self {
            rel,
            text,
            tree: None,
            current: Rep::Text,
            dirty,
        }
    }

    pub fn rel_path(&self) -> &Path {
        &self.rel
    }

    /// Read access to the string form, resynced from the tree if the tree
    /// holds the latest edits.
    pub fn text(&mut self) -> &str {
        if self.current == Rep::Tree {
            if let Some(tree) = &self.tree {
                self.text = dom::to_xml(tree);
            }
        }
        &self.text
    }

    /// Replace the string form. The tree is discarded and re-parsed on the
    /// next tree access.
    pub fn set_text(&mut self, text: String) {
        self.text = text;
        self.tree = None;
        self.current = Rep::Text;
        self.dirty = true;
    }

    /// Apply a string-level rewrite. Marks dirty only when the text changed.
    pub fn rewrite_text<F>(&mut self, f: F)
    where
        F: FnOnce(&str) -> String,
    {
        let old = self.text().to_string();
        let new = f(&old);
        if new != old {
            self.set_text(new);
        }
    }

    /// Read access to the tree form, parsing if the string holds the latest
    /// edits.
    pub fn tree(&mut self) -> Result<&Dom> {
        self.sync_tree()?;
        Ok(self.tree.as_ref().unwrap())
    }

    /// Mutable access to the tree form. From here on the tree is current
    /// until the next `set_text`.
    pub fn tree_mut(&mut self) -> Result<&mut Dom> {
        self.sync_tree()?;
        self.current = Rep::Tree;
        self.dirty = true;
        Ok(self.tree.as_mut().unwrap())
    }

    fn sync_tree(&mut self) -> Result<()> {
        if self.tree.is_none() {
            self.tree = Some(dom::parse(&self.text, &self.rel)?);
        }
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Path-keyed document cache over the scratch tree.
pub struct SourceTree {
    root: PathBuf,
    docs: HashMap<PathBuf, Document>,
}

impl SourceTree {
    /// Open a container-layout tree (`mimetype`, `META-INF/`, content
    /// directory) rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.join("META-INF/container.xml").is_file() {
            return Err(Error::InvalidSource(format!(
                "{} has no META-INF/container.xml",
                root.display()
            )));
        }
        Ok(Self {
            root,
            docs: HashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path for a root-relative path.
    pub fn abs(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.root.join(rel)
    }

    pub fn exists(&self, rel: impl AsRef<Path>) -> bool {
        self.abs(rel).exists()
    }

    /// Get-or-load a document. The same entry is handed back for the life of
    /// the build unless [`SourceTree::invalidate`] drops it.
    pub fn get(&mut self, rel: impl AsRef<Path>) -> Result<&mut Document> {
        let rel = rel.as_ref().to_path_buf();
        if !self.docs.contains_key(&rel) {
            let abs = self.root.join(&rel);
            let text = fs::read_to_string(&abs).map_err(|_| Error::MissingAsset(abs.clone()))?;
            debug!(path = %rel.display(), "loaded document");
            self.docs
                .insert(rel.clone(), Document::from_text(rel.clone(), text, false));
        }
        Ok(self.docs.get_mut(&rel).unwrap())
    }

    /// Register a brand-new document that does not exist on disk yet.
    pub fn create(&mut self, rel: impl AsRef<Path>, text: String) -> &mut Document {
        let rel = rel.as_ref().to_path_buf();
        self.docs
            .insert(rel.clone(), Document::from_text(rel.clone(), text, true));
        self.docs.get_mut(&rel).unwrap()
    }

    /// Drop a cached entry so the next `get` re-reads the file. Required
    /// after an out-of-band rewrite (the canonicalizer writing in place).
    pub fn invalidate(&mut self, rel: impl AsRef<Path>) {
        self.docs.remove(rel.as_ref());
    }

    /// Delete a document from the cache and from disk.
    pub fn remove(&mut self, rel: impl AsRef<Path>) -> Result<()> {
        let rel = rel.as_ref().to_path_buf();
        self.docs.remove(&rel);
        let abs = self.root.join(&rel);
        if abs.exists() {
            fs::remove_file(&abs)?;
        }
        Ok(())
    }

    /// Relative paths of every cached document, sorted.
    pub fn loaded(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.docs.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Serialize every dirty document back to the scratch tree.
    pub fn save_all(&mut self) -> Result<()> {
        let mut rels: Vec<_> = self
            .docs
            .iter()
            .filter(|(_, d)| d.dirty)
            .map(|(rel, _)| rel.clone())
            .collect();
        rels.sort();
        for rel in rels {
            self.save(&rel)?;
        }
        Ok(())
    }

    /// Serialize one document back to disk, creating parent directories for
    /// newly registered files.
    pub fn save(&mut self, rel: impl AsRef<Path>) -> Result<()> {
        let rel = rel.as_ref().to_path_buf();
        let root = self.root.clone();
        if let Some(doc) = self.docs.get_mut(&rel) {
            let abs = root.join(&rel);
            if let Some(parent) = abs.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&abs, doc.text())?;
            doc.dirty = false;
            debug!(path = %rel.display(), "saved document");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with(files: &[(&str, &str)]) -> (tempfile::TempDir, SourceTree) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("META-INF")).unwrap();
        fs::write(
            dir.path().join("META-INF/container.xml"),
            "<container/>",
        )
        .unwrap();
        for (rel, content) in files {
            let abs = dir.path().join(rel);
            fs::create_dir_all(abs.parent().unwrap()).unwrap();
            fs::write(abs, content).unwrap();
        }
        let tree = SourceTree::open(dir.path()).unwrap();
        (dir, tree)
    }

    #[test]
    fn get_parses_once_and_shares_the_tree() {
        let (_dir, mut tree) = tree_with(&[("epub/text/a.xhtml", "<html><body><p>x</p></body></html>")]);

        {
            let doc = tree.get("epub/text/a.xhtml").unwrap();
            let dom = doc.tree_mut().unwrap();
            let p = dom.find_by_tag("p").unwrap();
            dom.add_class(p, "marked");
        }
        // Second access sees the same mutated tree.
        let doc = tree.get("epub/text/a.xhtml").unwrap();
        let dom = doc.tree().unwrap();
        let p = dom.find_by_tag("p").unwrap();
        assert_eq!(dom.get_attr(p, "class"), Some("marked"));
    }

    #[test]
    fn text_access_resyncs_from_tree() {
        let (_dir, mut tree) = tree_with(&[("epub/text/a.xhtml", "<html><body><p>x</p></body></html>")]);

        let doc = tree.get("epub/text/a.xhtml").unwrap();
        {
            let dom = doc.tree_mut().unwrap();
            let p = dom.find_by_tag("p").unwrap();
            dom.set_attr(p, "id", "p1");
        }
        assert!(doc.text().contains(r#"<p id="p1">x</p>"#));
    }

    #[test]
    fn tree_access_resyncs_from_text() {
        let (_dir, mut tree) = tree_with(&[("epub/text/a.xhtml", "<html><body><p>x</p></body></html>")]);

        let doc = tree.get("epub/text/a.xhtml").unwrap();
        doc.rewrite_text(|t| t.replace("<p>x</p>", "<p>y</p>"));
        let dom = doc.tree().unwrap();
        let p = dom.find_by_tag("p").unwrap();
        assert_eq!(dom.text_of(p), "y");
    }

    #[test]
    fn invalidate_rereads_from_disk() {
        let (dir, mut tree) = tree_with(&[("epub/text/a.xhtml", "<html><body><p>x</p></body></html>")]);

        tree.get("epub/text/a.xhtml").unwrap();
        fs::write(
            dir.path().join("epub/text/a.xhtml"),
            "<html><body><p>rewritten</p></body></html>",
        )
        .unwrap();

        tree.invalidate("epub/text/a.xhtml");
        let doc = tree.get("epub/text/a.xhtml").unwrap();
        assert!(doc.text().contains("rewritten"));
    }

    #[test]
    fn save_all_writes_only_dirty_documents() {
        let (dir, mut tree) = tree_with(&[
            ("epub/text/a.xhtml", "<html><body><p>a</p></body></html>"),
            ("epub/text/b.xhtml", "<html><body><p>b</p></body></html>"),
        ]);

        tree.get("epub/text/a.xhtml")
            .unwrap()
            .rewrite_text(|t| t.replace("<p>a</p>", "<p>A</p>"));
        tree.get("epub/text/b.xhtml").unwrap(); // loaded, untouched

        tree.save_all().unwrap();

        let a = fs::read_to_string(dir.path().join("epub/text/a.xhtml")).unwrap();
        let b = fs::read_to_string(dir.path().join("epub/text/b.xhtml")).unwrap();
        assert!(a.contains("<p>A</p>"));
        assert_eq!(b, "<html><body><p>b</p></body></html>");
    }

    #[test]
    fn missing_file_is_a_missing_asset() {
        let (_dir, mut tree) = tree_with(&[]);
        match tree.get("epub/text/nope.xhtml") {
            Err(Error::MissingAsset(path)) => {
                assert!(path.ends_with("epub/text/nope.xhtml"));
            }
            Err(other) => panic!("expected MissingAsset, got {other:?}"),
            Ok(_) => panic!("expected MissingAsset, got a document"),
        }
    }

    #[test]
    fn create_registers_and_saves_new_files() {
        let (dir, mut tree) = tree_with(&[]);
        tree.create(
            "epub/text/endnotes-2.xhtml",
            "<html><body/></html>".to_string(),
        );
        tree.save_all().unwrap();
        assert!(dir.path().join("epub/text/endnotes-2.xhtml").is_file());
    }
}
