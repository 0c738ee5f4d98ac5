//! Structural classification of heading paths.
//!
//! Every prefix of a heading path is a candidate structural node. A title
//! containing the word "chapter" fixes the Chapter level for that path and
//! everything above it; paths without such a title fall back to "parent is a
//! Chapter, grandparent is a Book". When paths disagree the higher rank wins.

use std::collections::HashMap;

use super::dtag::slugify;
use super::SectionEntry;

/// Structural rank of an index node. Ordered so that `Collection` wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    Chapter,
    Book,
    Collection,
}

/// Which structural node a leaf hangs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    /// Length of the owning path prefix; `0` is the root.
    pub len: usize,
    /// The leaf was placed by the "parent is a Chapter" fallback.
    pub fallback: bool,
}

/// Roles of all structural path prefixes in a tree.
#[derive(Debug, Default)]
pub struct RoleMap {
    roles: HashMap<Vec<String>, Role>,
}

impl RoleMap {
    pub fn build(sections: &[SectionEntry]) -> Self {
        let mut map = RoleMap::default();

        for section in sections {
            let path = &section.path_titles;
            let n = path.len();
            let Some(k) = nearest_chapter(path) else {
                continue;
            };
            let book_end = if k + 1 < n {
                map.assign(&path[..=k], Role::Chapter);
                k
            } else {
                k.min(n - 1)
            };
            if book_end >= 1 {
                map.assign(&path[..book_end], Role::Book);
            }
            for j in 1..book_end {
                map.assign(&path[..j], Role::Collection);
            }
        }

        for section in sections {
            let path = &section.path_titles;
            let n = path.len();
            if n < 2 || nearest_chapter(path).is_some() {
                continue;
            }
            if map.roles.contains_key(&path[..n - 1]) {
                continue;
            }
            map.roles.insert(path[..n - 1].to_vec(), Role::Chapter);
            if n >= 3 && !map.roles.contains_key(&path[..n - 2]) {
                map.roles.insert(path[..n - 2].to_vec(), Role::Book);
            }
            for j in 1..n.saturating_sub(2) {
                map.roles.entry(path[..j].to_vec()).or_insert(Role::Collection);
            }
        }

        map
    }

    pub fn get(&self, path: &[String]) -> Option<Role> {
        self.roles.get(path).copied()
    }

    fn assign(&mut self, path: &[String], role: Role) {
        let slot = self.roles.entry(path.to_vec()).or_insert(role);
        if role > *slot {
            *slot = role;
        }
    }

    /// Where the leaf at `path` attaches. Headings between the owner and the
    /// leaf are folded into the owner.
    pub fn owner(&self, path: &[String]) -> Owner {
        let n = path.len();
        if n == 0 {
            return Owner { len: 0, fallback: false };
        }
        if self.get(path).is_some() {
            return Owner { len: n, fallback: false };
        }
        match nearest_chapter(path) {
            Some(k) if k + 1 < n => Owner { len: k + 1, fallback: false },
            Some(_) => Owner { len: n - 1, fallback: false },
            None => Owner { len: n - 1, fallback: true },
        }
    }
}

/// Index of the deepest title (leaf included) containing the word "chapter".
fn nearest_chapter(path: &[String]) -> Option<usize> {
    path.iter().rposition(|t| has_chapter_word(t))
}

pub fn has_chapter_word(title: &str) -> bool {
    title
        .split(|c: char| !c.is_alphanumeric())
        .any(|w| w.eq_ignore_ascii_case("chapter"))
}

/// `c` tag value: the number following "chapter" when present, otherwise the
/// normalized title.
pub fn chapter_value(title: &str) -> String {
    let words: Vec<&str> = title
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    words
        .windows(2)
        .find(|w| w[0].eq_ignore_ascii_case("chapter") && w[1].bytes().all(|b| b.is_ascii_digit()))
        .map(|w| w[1].to_string())
        .unwrap_or_else(|| slugify(title))
}

/// `s` tag value: the verse number of an `N:M` reference, otherwise the
/// normalized title.
pub fn section_value(title: &str) -> String {
    let trimmed = title.trim().trim_end_matches('.');
    if let Some((chapter, verse)) = trimmed.split_once(':') {
        let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        if digits(chapter.trim()) && digits(verse.trim()) {
            return verse.trim().to_string();
        }
    }
    slugify(title)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(path: &[&str]) -> SectionEntry {
        SectionEntry {
            path_titles: path.iter().map(|s| s.to_string()).collect(),
            path_levels: (1..=path.len() as u32).collect(),
            content: "text".into(),
        }
    }

    fn p(path: &[&str]) -> Vec<String> {
        path.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn chapter_word_is_whole_word() {
        assert!(has_chapter_word("Genesis Chapter 1"));
        assert!(has_chapter_word("CHAPTER IV"));
        assert!(has_chapter_word("chapter-2"));
        assert!(!has_chapter_word("Chapters and verses"));
        assert!(!has_chapter_word("Chapterhouse"));
    }

    #[test]
    fn explicit_chapters_set_book_and_collection() {
        let tree = [
            section(&["Bible", "Genesis", "Genesis Chapter 1", "1:1"]),
            section(&["Bible", "Genesis", "Genesis Chapter 2", "2:1"]),
        ];
        let roles = RoleMap::build(&tree);
        assert_eq!(roles.get(&p(&["Bible"])), Some(Role::Collection));
        assert_eq!(roles.get(&p(&["Bible", "Genesis"])), Some(Role::Book));
        assert_eq!(
            roles.get(&p(&["Bible", "Genesis", "Genesis Chapter 1"])),
            Some(Role::Chapter)
        );
        let owner = roles.owner(&tree[0].path_titles);
        assert_eq!(owner, Owner { len: 3, fallback: false });
    }

    #[test]
    fn chapter_titled_leaf_hangs_under_book() {
        let tree = [section(&["Bible", "Genesis", "Genesis Chapter 1"])];
        let roles = RoleMap::build(&tree);
        assert_eq!(roles.get(&p(&["Bible", "Genesis"])), Some(Role::Book));
        assert_eq!(roles.get(&p(&["Bible"])), Some(Role::Collection));
        assert_eq!(roles.get(&tree[0].path_titles), None);
        assert_eq!(roles.owner(&tree[0].path_titles).len, 2);
    }

    #[test]
    fn fallback_uses_parent_and_grandparent() {
        let tree = [section(&["Works", "Essays", "On Gardens", "Part 1"])];
        let roles = RoleMap::build(&tree);
        assert_eq!(roles.get(&p(&["Works", "Essays", "On Gardens"])), Some(Role::Chapter));
        assert_eq!(roles.get(&p(&["Works", "Essays"])), Some(Role::Book));
        assert_eq!(roles.get(&p(&["Works"])), Some(Role::Collection));
        assert_eq!(
            roles.owner(&tree[0].path_titles),
            Owner { len: 3, fallback: true }
        );
    }

    #[test]
    fn fallback_does_not_override_explicit_book() {
        let tree = [
            section(&["Bible", "Genesis", "Genesis Chapter 1", "1:1"]),
            section(&["Bible", "Genesis", "Introduction"]),
        ];
        let roles = RoleMap::build(&tree);
        assert_eq!(roles.get(&p(&["Bible", "Genesis"])), Some(Role::Book));
        assert_eq!(roles.owner(&tree[1].path_titles), Owner { len: 2, fallback: true });
    }

    #[test]
    fn intermediate_headings_fold_into_chapter() {
        let tree = [section(&["Book", "Chapter 3", "Part A", "Verse"])];
        let roles = RoleMap::build(&tree);
        assert_eq!(roles.owner(&tree[0].path_titles).len, 2);
        assert_eq!(roles.get(&p(&["Book", "Chapter 3", "Part A"])), None);
    }

    #[test]
    fn higher_rank_wins() {
        let tree = [
            section(&["A", "B", "Chapter 1", "x"]),
            section(&["A", "B", "C", "Chapter 1", "y"]),
        ];
        let roles = RoleMap::build(&tree);
        assert_eq!(roles.get(&p(&["A", "B"])), Some(Role::Collection));
    }

    #[test]
    fn single_level_paths_hang_under_root() {
        let tree = [section(&["Only"])];
        let roles = RoleMap::build(&tree);
        assert_eq!(roles.owner(&tree[0].path_titles), Owner { len: 0, fallback: true });
    }

    #[test]
    fn tag_values() {
        assert_eq!(chapter_value("Genesis Chapter 12"), "12");
        assert_eq!(chapter_value("Prologue"), "prologue");
        assert_eq!(chapter_value("Chapter Nine"), "chapter-nine");
        assert_eq!(section_value("3:16"), "16");
        assert_eq!(section_value(" 3:16. "), "16");
        assert_eq!(section_value("Note: Translator"), "note-translator");
    }
}
