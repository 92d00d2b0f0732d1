//! Compiled-code units and the source repository.
//!
//! A [`CodeUnit`] tree mirrors what the runtime loads: one script unit
//! whose children are method and block units. Traversals use an explicit
//! worklist so adversarially deep trees cannot overflow the stack.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::sync::lock;

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

/// Kind of a compiled-code unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// Top-level code of a file.
    Script,
    Method,
    Block,
    /// Code compiled from a string at runtime.
    Eval,
}

/// The smallest independently loadable chunk of executable code.
#[derive(Debug)]
pub struct CodeUnit {
    id: u64,
    path: String,
    label: String,
    kind: UnitKind,
    first_line: u32,
    last_line: u32,
    /// Traceable lines owned by this unit, not its children. Sorted.
    lines: Vec<u32>,
    children: Vec<Arc<CodeUnit>>,
}

/// Builder for [`CodeUnit`] trees.
#[derive(Debug)]
pub struct UnitBuilder {
    path: String,
    label: String,
    kind: UnitKind,
    first_line: u32,
    last_line: u32,
    lines: Vec<u32>,
    children: Vec<UnitBuilder>,
}

impl UnitBuilder {
    /// Traceable lines of this unit.
    pub fn lines(mut self, lines: impl IntoIterator<Item = u32>) -> Self {
        self.lines.extend(lines);
        self
    }

    /// Nest a child unit. The child inherits this unit's path.
    pub fn child(mut self, child: UnitBuilder) -> Self {
        self.children.push(child);
        self
    }

    /// Finish the tree. Children take their parent's path.
    pub fn build(self) -> Arc<CodeUnit> {
        let path = self.path.clone();
        self.build_with_path(&path)
    }

    fn build_with_path(mut self, path: &str) -> Arc<CodeUnit> {
        self.lines.sort_unstable();
        self.lines.dedup();
        let children = self
            .children
            .into_iter()
            .map(|c| c.build_with_path(path))
            .collect();
        Arc::new(CodeUnit {
            id: NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed),
            path: path.to_string(),
            label: self.label,
            kind: self.kind,
            first_line: self.first_line,
            last_line: self.last_line,
            lines: self.lines,
            children,
        })
    }
}

impl CodeUnit {
    fn builder(path: &str, label: &str, kind: UnitKind, first: u32, last: u32) -> UnitBuilder {
        UnitBuilder {
            path: path.to_string(),
            label: label.to_string(),
            kind,
            first_line: first,
            last_line: last,
            lines: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Top-level unit of the file at `path`.
    pub fn script(path: &str, first: u32, last: u32) -> UnitBuilder {
        Self::builder(path, "<main>", UnitKind::Script, first, last)
    }

    /// A method body labelled `label`, e.g. `Calc#add`.
    pub fn method(label: &str, first: u32, last: u32) -> UnitBuilder {
        Self::builder("", label, UnitKind::Method, first, last)
    }

    /// A block body.
    pub fn block(label: &str, first: u32, last: u32) -> UnitBuilder {
        Self::builder("", label, UnitKind::Block, first, last)
    }

    /// Code evaluated from a string, reported under a synthetic path.
    pub fn eval(path: &str, first: u32, last: u32) -> UnitBuilder {
        Self::builder(path, "<eval>", UnitKind::Eval, first, last)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn first_line(&self) -> u32 {
        self.first_line
    }

    pub fn last_line(&self) -> u32 {
        self.last_line
    }

    pub fn children(&self) -> &[Arc<CodeUnit>] {
        &self.children
    }

    /// Traceable lines of this unit alone.
    pub fn traceable_lines(&self) -> &[u32] {
        &self.lines
    }

    pub fn covers(&self, line: u32) -> bool {
        (self.first_line..=self.last_line).contains(&line)
    }

    /// All units of the tree rooted at `root`, parents before children.
    pub fn walk(root: &Arc<CodeUnit>) -> Vec<Arc<CodeUnit>> {
        let mut out = Vec::new();
        let mut worklist = vec![Arc::clone(root)];
        while let Some(unit) = worklist.pop() {
            worklist.extend(unit.children.iter().rev().cloned());
            out.push(unit);
        }
        out
    }

    /// The nearest traceable line at or after `line`, and the unit owning it.
    pub fn find_line(root: &Arc<CodeUnit>, line: u32) -> Option<(Arc<CodeUnit>, u32)> {
        let mut best: Option<(Arc<CodeUnit>, u32)> = None;
        let mut worklist = vec![Arc::clone(root)];
        while let Some(unit) = worklist.pop() {
            if let Some(&l) = unit.lines.iter().find(|&&l| l >= line) {
                let better = match &best {
                    Some((_, b)) => l < *b,
                    None => true,
                };
                if better {
                    best = Some((Arc::clone(&unit), l));
                }
            }
            worklist.extend(unit.children.iter().cloned());
        }
        best
    }

    /// The innermost unit whose range covers `line`.
    pub fn unit_at(root: &Arc<CodeUnit>, line: u32) -> Option<Arc<CodeUnit>> {
        let mut found = None;
        let mut worklist = vec![Arc::clone(root)];
        while let Some(unit) = worklist.pop() {
            if unit.covers(line) {
                worklist.clear();
                worklist.extend(unit.children.iter().cloned());
                found = Some(unit);
            }
        }
        found
    }

    /// The traceable line following `line` in this unit (children excluded),
    /// falling back to the unit's last line.
    pub fn next_line(&self, line: u32) -> Option<u32> {
        self.lines
            .iter()
            .copied()
            .find(|&l| l > line)
            .or((self.last_line > line).then_some(self.last_line))
    }
}

/// How a load relates to what was seen before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    /// The path was never loaded.
    First,
    /// The same path was loaded again (hot reload).
    Reload,
    /// An evaluated snippet. Never counts as a reload.
    Snippet,
}

#[derive(Debug, Default)]
struct SourceFile {
    lines: Arc<Vec<String>>,
    roots: Vec<Arc<CodeUnit>>,
}

/// Source text and code units of everything the runtime loaded.
#[derive(Debug, Default)]
pub struct SourceRepository {
    files: Mutex<HashMap<String, SourceFile>>,
    order: Mutex<Vec<String>>,
}

impl SourceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a loaded unit and its source text.
    pub fn add(&self, unit: &Arc<CodeUnit>, src: Option<&str>) -> LoadKind {
        let mut files = lock(&self.files);
        let path = unit.path().to_string();
        let kind = if unit.kind() == UnitKind::Eval {
            LoadKind::Snippet
        } else if files.contains_key(&path) {
            LoadKind::Reload
        } else {
            LoadKind::First
        };

        let entry = files.entry(path.clone()).or_insert_with(|| {
            lock(&self.order).push(path.clone());
            SourceFile::default()
        });
        if let Some(src) = src {
            entry.lines = Arc::new(src.lines().map(str::to_string).collect());
        }
        if kind == LoadKind::Reload {
            entry.roots.clear();
        }
        entry.roots.push(Arc::clone(unit));
        tracing::debug!(path = %path, kind = ?kind, "source recorded");
        kind
    }

    /// Source lines of `path`, if known.
    pub fn lines(&self, path: &str) -> Option<Arc<Vec<String>>> {
        lock(&self.files)
            .get(path)
            .filter(|f| !f.lines.is_empty())
            .map(|f| Arc::clone(&f.lines))
    }

    pub fn has_source(&self, path: &str) -> bool {
        self.lines(path).is_some()
    }

    /// Paths in load order.
    pub fn paths(&self) -> Vec<String> {
        lock(&self.order).clone()
    }

    /// Root units currently loaded for `path`.
    pub fn roots(&self, path: &str) -> Vec<Arc<CodeUnit>> {
        lock(&self.files)
            .get(path)
            .map(|f| f.roots.clone())
            .unwrap_or_default()
    }

    /// Whether `line` is a traceable line of any unit loaded for `path`.
    pub fn is_traceable(&self, path: &str, line: u32) -> bool {
        self.roots(path).iter().any(|root| {
            CodeUnit::walk(root)
                .iter()
                .any(|u| u.traceable_lines().contains(&line))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Arc<CodeUnit> {
        CodeUnit::script("app.rb", 1, 20)
            .lines([1, 2, 12, 14])
            .child(
                CodeUnit::method("Calc#add", 3, 7)
                    .lines([4, 5])
                    .child(CodeUnit::block("block in Calc#add", 5, 6).lines([6])),
            )
            .child(CodeUnit::method("Calc#sub", 8, 10).lines([9]))
            .build()
    }

    #[test]
    fn children_inherit_path() {
        let root = sample();
        assert!(CodeUnit::walk(&root).iter().all(|u| u.path() == "app.rb"));
        assert_eq!(CodeUnit::walk(&root).len(), 4);
    }

    #[test]
    fn find_line_prefers_nearest_following_line() {
        let root = sample();
        let (unit, line) = CodeUnit::find_line(&root, 3).unwrap();
        assert_eq!((unit.label(), line), ("Calc#add", 4));
        let (unit, line) = CodeUnit::find_line(&root, 6).unwrap();
        assert_eq!((unit.label(), line), ("block in Calc#add", 6));
        let (unit, line) = CodeUnit::find_line(&root, 11).unwrap();
        assert_eq!((unit.label(), line), ("<main>", 12));
        assert!(CodeUnit::find_line(&root, 15).is_none());
    }

    #[test]
    fn deep_trees_are_searched_iteratively() {
        let found = std::thread::Builder::new()
            .stack_size(64 * 1024 * 1024)
            .spawn(|| {
                let mut b = CodeUnit::block("leaf", 1, 1).lines([1]);
                for i in 0..5_000 {
                    b = CodeUnit::block(&format!("b{i}"), 1, 1).child(b);
                }
                let root = CodeUnit::script("deep.rb", 1, 1).child(b).build();
                let found = CodeUnit::find_line(&root, 1).map(|(u, l)| (u.label().to_string(), l));
                assert_eq!(CodeUnit::walk(&root).len(), 5_002);
                found
            })
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(found, Some(("leaf".to_string(), 1)));
    }

    #[test]
    fn unit_at_finds_innermost() {
        let root = sample();
        assert_eq!(CodeUnit::unit_at(&root, 6).unwrap().label(), "block in Calc#add");
        assert_eq!(CodeUnit::unit_at(&root, 9).unwrap().label(), "Calc#sub");
        assert_eq!(CodeUnit::unit_at(&root, 13).unwrap().label(), "<main>");
    }

    #[test]
    fn next_line_skips_children_and_falls_back_to_last() {
        let root = sample();
        let add = CodeUnit::unit_at(&root, 4).unwrap();
        assert_eq!(add.next_line(4), Some(5));
        assert_eq!(add.next_line(5), Some(7));
        assert_eq!(root.next_line(2), Some(12));
    }

    #[test]
    fn reload_is_detected_by_path_but_not_for_snippets() {
        let repo = SourceRepository::new();
        assert_eq!(repo.add(&sample(), Some("a\nb\n")), LoadKind::First);
        assert_eq!(repo.add(&sample(), None), LoadKind::Reload);
        assert_eq!(repo.roots("app.rb").len(), 1);

        let snippet = CodeUnit::eval("(eval at app.rb:2)", 1, 1).lines([1]).build();
        assert_eq!(repo.add(&snippet, Some("x")), LoadKind::Snippet);
        assert_eq!(repo.add(&snippet, Some("x")), LoadKind::Snippet);
        assert_eq!(repo.paths(), vec!["app.rb", "(eval at app.rb:2)"]);
        assert_eq!(repo.lines("app.rb").unwrap().len(), 2);
        assert!(repo.is_traceable("app.rb", 9));
        assert!(!repo.is_traceable("app.rb", 3));
    }
}
