//! Publication compiler: parsed heading tree in, ordered unsigned record
//! graph out.
//!
//! The graph is a tree of index records (kind 30040) with content records
//! (kind 30041) as leaves. Every parent lists its children as `a` tags in
//! emission order, parents are always emitted before their children, and
//! Books never hold content directly: a synthetic "Preamble" chapter is
//! inserted to carry it.

pub mod dtag;
pub mod hierarchy;

use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::event::{Coordinate, Draft, Tag, KIND_CONTENT, KIND_INDEX, PUBKEY_PLACEHOLDER};
use dtag::{derive_d_tag, preamble_d_tag, slugify, with_suffix};
use hierarchy::{chapter_value, section_value, Role, RoleMap};

const ROOT: usize = 0;
const PREAMBLE_TITLE: &str = "Preamble";
const CONTENT_MEDIA_TYPE: &str = "text/asciidoc";

/// One leaf of the parsed document: the heading titles from the top level
/// down to the leaf, their heading levels, and the leaf body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SectionEntry {
    pub path_titles: Vec<String>,
    #[serde(default)]
    pub path_levels: Vec<u32>,
    pub content: String,
}

/// Parser output: leaf sections in document order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedTree {
    pub sections: Vec<SectionEntry>,
    /// Deepest heading level that carries content.
    #[serde(default)]
    pub leaf_level: u32,
}

/// Long and short canonical names for a Book, used as extra `T` values.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CanonicalName {
    pub long: Option<String>,
    pub short: Option<String>,
}

/// Descriptive metadata written onto the root record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub summary: Option<String>,
    pub published_on: Option<String>,
    pub published_by: Option<String>,
    pub source: Option<String>,
    pub image: Option<String>,
    /// Edition or translation, emitted as `v` on every record.
    pub version: Option<String>,
    #[serde(rename = "type")]
    pub publication_type: Option<String>,
    pub auto_update: Option<String>,
    pub derivative_author: Option<String>,
    pub derivative_event: Option<String>,
    pub derivative_relay: Option<String>,
    pub derivative_pubkey: Option<String>,
    pub additional_tags: Vec<Vec<String>>,
    /// Defaults for the command-line `--language` and `--collection-id`.
    pub language: Option<String>,
    pub collection_id: Option<String>,
    /// Display title → canonical names.
    pub book_titles: BTreeMap<String, CanonicalName>,
}

impl Metadata {
    fn publication_type(&self) -> &str {
        self.publication_type.as_deref().unwrap_or("book")
    }

    fn auto_update(&self) -> &str {
        self.auto_update.as_deref().unwrap_or("ask")
    }

    fn canonical_name(&self, title: &str) -> Option<&CanonicalName> {
        self.book_titles.get(title).or_else(|| {
            self.book_titles
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(title))
                .map(|(_, v)| v)
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    pub collection_id: String,
    pub language: String,
    /// Relay URL written as the hint in every address tag.
    pub relay_hint: String,
    pub metadata: Metadata,
}

/// Parent → child relation between two entries of [`CompiledGraph::drafts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub parent: usize,
    pub child: usize,
}

/// Counts and recovered anomalies from one compile run.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CompileReport {
    pub index_records: usize,
    pub content_records: usize,
    pub duplicates_dropped: usize,
    pub duplicate_d_tags: Vec<String>,
    pub preambles: usize,
    /// Leaves placed by the "parent is a Chapter" fallback.
    pub fallback_sections: usize,
}

impl CompileReport {
    fn record_duplicate(&mut self, d: &str) {
        self.duplicates_dropped += 1;
        self.duplicate_d_tags.push(d.to_string());
    }
}

#[derive(Debug, Clone)]
pub struct CompiledGraph {
    /// Records in emission order; the root is first.
    pub drafts: Vec<Draft>,
    pub edges: Vec<Edge>,
    pub report: CompileReport,
}

/// Classification of a node in the publication tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Collection,
    Book,
    Chapter,
    Preamble,
    Section,
}

impl From<Role> for NodeRole {
    fn from(role: Role) -> Self {
        match role {
            Role::Collection => NodeRole::Collection,
            Role::Book => NodeRole::Book,
            Role::Chapter => NodeRole::Chapter,
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    kind: u32,
    role: NodeRole,
    d: String,
    title: String,
    content: String,
    parent: Option<usize>,
    titles: Vec<String>,
    chapter: Option<String>,
    section: Option<String>,
}

/// Compile a parsed tree into an unsigned record graph.
pub fn compile(tree: &ParsedTree, opts: &CompileOptions) -> Result<CompiledGraph> {
    if slugify(&opts.collection_id).is_empty() {
        bail!("collection id '{}' has no usable characters", opts.collection_id);
    }
    if tree.sections.is_empty() {
        bail!("parsed tree contains no sections");
    }
    let sections: Vec<SectionEntry> = tree.sections.iter().map(normalize_section).collect();
    debug!(sections = sections.len(), leaf_level = tree.leaf_level, "compiling tree");

    let mut compiler = Compiler::new(opts, &sections);
    for section in &sections {
        compiler.add_section(section);
    }
    compiler.synthesize_preambles();
    let graph = compiler.finish();

    info!(
        index = graph.report.index_records,
        content = graph.report.content_records,
        duplicates = graph.report.duplicates_dropped,
        preambles = graph.report.preambles,
        fallback = graph.report.fallback_sections,
        "compiled publication graph"
    );
    Ok(graph)
}

fn normalize_section(section: &SectionEntry) -> SectionEntry {
    SectionEntry {
        path_titles: section
            .path_titles
            .iter()
            .map(|t| {
                let t = t.trim();
                if t.is_empty() { "Untitled".to_string() } else { t.to_string() }
            })
            .collect(),
        path_levels: section.path_levels.clone(),
        content: section.content.clone(),
    }
}

/// When every leaf shares one top heading classified as a Collection, that
/// heading is the root instead of a synthesized one.
fn shared_root(sections: &[SectionEntry], roles: &RoleMap) -> Option<Vec<String>> {
    let first = sections.first()?.path_titles.first()?;
    let shared = sections
        .iter()
        .all(|s| s.path_titles.first() == Some(first));
    let top = vec![first.clone()];
    (shared && roles.get(&top) == Some(Role::Collection)).then_some(top)
}

/// Mutable state of one compile run.
struct Compiler<'a> {
    opts: &'a CompileOptions,
    roles: RoleMap,
    shared_root: Option<Vec<String>>,
    collection_tag: String,
    nodes: Vec<Node>,
    order: Vec<usize>,
    by_path: HashMap<Vec<String>, usize>,
    by_key: HashMap<(u32, String), usize>,
    report: CompileReport,
}

impl<'a> Compiler<'a> {
    fn new(opts: &'a CompileOptions, sections: &[SectionEntry]) -> Self {
        let roles = RoleMap::build(sections);
        let shared_root = shared_root(sections, &roles);
        let title = shared_root
            .as_ref()
            .map(|p| p[0].clone())
            .or_else(|| opts.metadata.title.clone())
            .unwrap_or_else(|| opts.collection_id.clone());
        let root = Node {
            kind: KIND_INDEX,
            role: NodeRole::Collection,
            d: derive_d_tag(&[opts.collection_id.as_str()]),
            titles: vec![slugify(&title)],
            title,
            content: String::new(),
            parent: None,
            chapter: None,
            section: None,
        };

        let mut compiler = Compiler {
            opts,
            roles,
            shared_root,
            collection_tag: slugify(&opts.collection_id),
            nodes: Vec::new(),
            order: Vec::new(),
            by_path: HashMap::new(),
            by_key: HashMap::new(),
            report: CompileReport::default(),
        };
        compiler.push(root);
        compiler
    }

    fn push(&mut self, node: Node) -> usize {
        let idx = self.nodes.len();
        self.by_key.insert((node.kind, node.d.clone()), idx);
        self.nodes.push(node);
        self.order.push(idx);
        idx
    }

    fn d_for(&self, path: &[String]) -> String {
        let skip = usize::from(self.shared_root.is_some());
        let mut parts = vec![self.opts.collection_id.as_str()];
        parts.extend(path.iter().skip(skip).map(String::as_str));
        derive_d_tag(&parts)
    }

    fn add_section(&mut self, section: &SectionEntry) {
        let path = &section.path_titles;
        let owner = self.roles.owner(path);
        if owner.fallback {
            self.report.fallback_sections += 1;
        }
        let parent = self.ensure_chain(&path[..owner.len]);

        let d = self.d_for(path);
        if self.by_key.contains_key(&(KIND_CONTENT, d.clone())) {
            warn!(d = %d, path = ?path, "duplicate content identifier, dropping section");
            self.report.record_duplicate(&d);
            return;
        }
        let title = path
            .last()
            .cloned()
            .unwrap_or_else(|| self.nodes[ROOT].title.clone());
        let node = self.child_node(
            parent,
            KIND_CONTENT,
            NodeRole::Section,
            d,
            title,
            section.content.clone(),
        );
        self.push(node);
    }

    /// Make sure every structural prefix of `owner` exists; returns the node
    /// the leaf attaches to.
    fn ensure_chain(&mut self, owner: &[String]) -> usize {
        let mut parent = ROOT;
        for len in 1..=owner.len() {
            let prefix = &owner[..len];
            let Some(role) = self.roles.get(prefix) else {
                continue;
            };
            if self.shared_root.as_deref() == Some(prefix) {
                parent = ROOT;
                continue;
            }
            if let Some(&idx) = self.by_path.get(prefix) {
                parent = idx;
                continue;
            }

            let mut d = self.d_for(prefix);
            if self.by_key.get(&(KIND_INDEX, d.clone())) == Some(&ROOT) {
                d = self.unused_index_d(&d);
            }
            if let Some(&existing) = self.by_key.get(&(KIND_INDEX, d.clone())) {
                warn!(d = %d, path = ?prefix, "duplicate index identifier, merging into earlier node");
                self.report.record_duplicate(&d);
                self.by_path.insert(prefix.to_vec(), existing);
                parent = existing;
                continue;
            }

            let title = prefix[len - 1].clone();
            let node = self.child_node(parent, KIND_INDEX, role.into(), d, title, String::new());
            let idx = self.push(node);
            self.by_path.insert(prefix.to_vec(), idx);
            parent = idx;
        }
        parent
    }

    /// A heading that compresses to the root's identifier is its own record.
    fn unused_index_d(&self, base: &str) -> String {
        let mut n = 2;
        loop {
            let candidate = with_suffix(base, n);
            if !self.by_key.contains_key(&(KIND_INDEX, candidate.clone())) {
                return candidate;
            }
            n += 1;
        }
    }

    /// New node under `parent`, inheriting its classification values.
    fn child_node(
        &self,
        parent: usize,
        kind: u32,
        role: NodeRole,
        d: String,
        title: String,
        content: String,
    ) -> Node {
        let p = &self.nodes[parent];
        let mut titles = p.titles.clone();
        let mut chapter = p.chapter.clone();
        let mut section = None;
        match role {
            NodeRole::Collection => titles = vec![slugify(&title)],
            NodeRole::Book => titles = self.book_titles(&title),
            NodeRole::Chapter => chapter = Some(chapter_value(&title)),
            NodeRole::Preamble => chapter = Some("preamble".to_string()),
            NodeRole::Section => section = Some(section_value(&title)),
        }
        Node {
            kind,
            role,
            d,
            title,
            content,
            parent: Some(parent),
            titles,
            chapter,
            section,
        }
    }

    fn book_titles(&self, title: &str) -> Vec<String> {
        let mut values = vec![slugify(title)];
        if let Some(name) = self.opts.metadata.canonical_name(title) {
            for alias in [&name.long, &name.short].into_iter().flatten() {
                let value = slugify(alias);
                if !values.contains(&value) {
                    values.push(value);
                }
            }
        }
        values.retain(|v| !v.is_empty());
        values
    }

    /// Move content sitting directly under a Book into a "Preamble" chapter
    /// placed immediately after the Book.
    fn synthesize_preambles(&mut self) {
        let books: Vec<usize> = self
            .order
            .iter()
            .copied()
            .filter(|&i| self.nodes[i].role == NodeRole::Book)
            .collect();

        for book in books {
            let strays: Vec<usize> = self
                .order
                .iter()
                .copied()
                .filter(|&i| self.nodes[i].parent == Some(book) && self.nodes[i].kind == KIND_CONTENT)
                .collect();
            if strays.is_empty() {
                continue;
            }
            let preamble = self.preamble_for(book);
            for idx in strays {
                let node = &mut self.nodes[idx];
                node.parent = Some(preamble);
                node.chapter = Some("preamble".to_string());
            }
        }
    }

    fn preamble_for(&mut self, book: usize) -> usize {
        let base = preamble_d_tag(&self.nodes[book].d);
        let mut attempt = 1;
        let d = loop {
            let candidate = if attempt == 1 { base.clone() } else { with_suffix(&base, attempt) };
            match self.by_key.get(&(KIND_INDEX, candidate.clone())) {
                Some(&existing) if self.nodes[existing].parent == Some(book) => return existing,
                Some(_) => {
                    warn!(d = %candidate, "preamble identifier already taken");
                    attempt += 1;
                }
                None => break candidate,
            }
        };

        let node = self.child_node(
            book,
            KIND_INDEX,
            NodeRole::Preamble,
            d,
            PREAMBLE_TITLE.to_string(),
            String::new(),
        );
        let idx = self.nodes.len();
        self.by_key.insert((node.kind, node.d.clone()), idx);
        self.nodes.push(node);
        let pos = self
            .order
            .iter()
            .position(|&i| i == book)
            .map_or(self.order.len(), |p| p + 1);
        self.order.insert(pos, idx);
        self.report.preambles += 1;
        idx
    }

    fn finish(mut self) -> CompiledGraph {
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        let mut position = vec![0; self.nodes.len()];
        for (pos, &idx) in self.order.iter().enumerate() {
            position[idx] = pos;
            if let Some(parent) = self.nodes[idx].parent {
                children[parent].push(idx);
            }
        }

        let drafts: Vec<Draft> = self
            .order
            .iter()
            .map(|&idx| self.draft_for(idx, &children[idx]))
            .collect();
        let edges = self
            .order
            .iter()
            .filter_map(|&idx| {
                self.nodes[idx].parent.map(|p| Edge {
                    parent: position[p],
                    child: position[idx],
                })
            })
            .collect();

        self.report.index_records = drafts.iter().filter(|d| d.kind == KIND_INDEX).count();
        self.report.content_records = drafts.iter().filter(|d| d.kind == KIND_CONTENT).count();
        CompiledGraph {
            drafts,
            edges,
            report: self.report,
        }
    }

    fn draft_for(&self, idx: usize, children: &[usize]) -> Draft {
        let node = &self.nodes[idx];
        let meta = &self.opts.metadata;
        let mut draft = Draft::new(node.kind);
        let tags = &mut draft.tags;

        tags.push(Tag::new(["d", node.d.as_str()]));
        tags.push(Tag::new(["title", node.title.as_str()]));
        if idx == ROOT {
            self.root_tags(tags);
        } else {
            tags.push(Tag::new(["type", meta.publication_type()]));
            if node.kind == KIND_INDEX {
                tags.push(Tag::new(["auto-update", meta.auto_update()]));
            }
        }
        if !self.opts.language.is_empty() {
            tags.push(Tag::new(["L", self.opts.language.as_str()]));
        }
        if node.kind == KIND_CONTENT {
            tags.push(Tag::new(["m", CONTENT_MEDIA_TYPE]));
        }

        tags.push(Tag::new(["C", self.collection_tag.as_str()]));
        // Titles without ASCII alphanumerics normalize to nothing.
        for title in node.titles.iter().filter(|t| !t.is_empty()) {
            tags.push(Tag::new(["T", title.as_str()]));
        }
        if let Some(c) = node.chapter.as_deref().filter(|c| !c.is_empty()) {
            tags.push(Tag::new(["c", c]));
        }
        if let Some(s) = node.section.as_deref().filter(|s| !s.is_empty()) {
            tags.push(Tag::new(["s", s]));
        }
        let version = meta.version.as_deref().map(slugify).unwrap_or_default();
        if !version.is_empty() {
            tags.push(Tag::new(["v".to_string(), version]));
        }

        for &child in children {
            let c = &self.nodes[child];
            let coordinate = Coordinate::new(c.kind, PUBKEY_PLACEHOLDER, c.d.as_str());
            tags.push(Tag::address(&coordinate, &self.opts.relay_hint));
        }

        draft.content = node.content.clone();
        draft
    }

    fn root_tags(&self, tags: &mut Vec<Tag>) {
        let meta = &self.opts.metadata;
        let optional = [
            ("author", &meta.author),
            ("published_on", &meta.published_on),
            ("published_by", &meta.published_by),
            ("summary", &meta.summary),
            ("image", &meta.image),
            ("source", &meta.source),
        ];
        for (name, value) in optional {
            if let Some(value) = value.as_deref().filter(|v| !v.trim().is_empty()) {
                tags.push(Tag::new([name, value]));
            }
        }
        tags.push(Tag::new(["type", meta.publication_type()]));
        tags.push(Tag::new(["auto-update", meta.auto_update()]));

        if let Some(author) = &meta.derivative_author {
            tags.push(Tag::new(["p", author.as_str()]));
        }
        if let Some(event) = &meta.derivative_event {
            tags.push(Tag::new([
                "E",
                event.as_str(),
                meta.derivative_relay.as_deref().unwrap_or(""),
                meta.derivative_pubkey.as_deref().unwrap_or(""),
            ]));
        }
        for extra in meta.additional_tags.iter().filter(|t| !t.is_empty()) {
            tags.push(Tag(extra.clone()));
        }
    }
}
