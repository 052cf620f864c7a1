//! Tag extraction over the document tree.
//!
//! A distinguished `.TAGS.md` node at the tree root organizes tags under
//! markdown headings. `scan_and_update` additionally walks every text and
//! markdown file, harvests `#hashtags`, and appends the ones `.TAGS.md`
//! does not already know under a `## Discovered Tags` heading.

use std::collections::BTreeSet;

use regex::Regex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use storage::{DocStore, VfsError};
use vfs::{FileContent, OwnerId};

use crate::DocService;

/// Well-known tag index file at the tree root.
pub const TAGS_FILE: &str = ".TAGS.md";

const DISCOVERED_HEADING: &str = "Discovered Tags";

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TagCategory {
    pub heading: String,
    pub tags: Vec<String>,
}

/// Parsed view of `.TAGS.md`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TagReport {
    /// Flat sorted unique union across all headings.
    pub tags: Vec<String>,
    pub categories: Vec<TagCategory>,
}

/// Outcome of a scan-and-update pass.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TagScanReport {
    pub existing_tags: usize,
    pub new_tags: usize,
    pub total_tags: usize,
}

fn hashtag_re() -> Regex {
    // A hashtag is '#' followed by a word character, then word characters
    // or dashes. "#1" alone does not count.
    Regex::new(r"#[A-Za-z_][A-Za-z0-9_-]*").expect("hashtag pattern")
}

/// Pull every hashtag out of one document body.
fn collect_hashtags(re: &Regex, text: &str, into: &mut BTreeSet<String>) {
    for m in re.find_iter(text) {
        into.insert(m.as_str().to_string());
    }
}

/// Parse `.TAGS.md` content into heading-grouped categories.
fn parse_categories(re: &Regex, content: &str) -> Vec<TagCategory> {
    let mut categories: Vec<TagCategory> = Vec::new();
    let mut current: Option<TagCategory> = None;

    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(heading) = heading_text(trimmed) {
            if let Some(cat) = current.take() {
                categories.push(cat);
            }
            current = Some(TagCategory {
                heading: heading.to_string(),
                tags: Vec::new(),
            });
            continue;
        }
        let mut found = BTreeSet::new();
        collect_hashtags(re, trimmed, &mut found);
        if found.is_empty() {
            continue;
        }
        let cat = current.get_or_insert_with(|| TagCategory {
            heading: String::new(),
            tags: Vec::new(),
        });
        for tag in found {
            if !cat.tags.contains(&tag) {
                cat.tags.push(tag);
            }
        }
    }
    if let Some(cat) = current.take() {
        categories.push(cat);
    }
    categories
}

/// A markdown heading line (`#`, `##`, ...) and its text, or None.
fn heading_text(line: &str) -> Option<&str> {
    let hashes = line.chars().take_while(|&c| c == '#').count();
    if hashes == 0 {
        return None;
    }
    let rest = &line[hashes..];
    // "#tag" is a hashtag, "# Heading" is a heading.
    if rest.starts_with(' ') || rest.is_empty() {
        Some(rest.trim())
    } else {
        None
    }
}

/// Directory-scan skip rule: dotfiles and underscore-prefixed entries
/// stay out of the walk.
fn skip_name(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('_')
}

fn is_scannable_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".md") || lower.ends_with(".txt")
}

async fn read_tags_file<S: DocStore>(
    svc: &DocService<S>,
    caller: OwnerId,
    root: &str,
) -> Result<Option<String>, VfsError> {
    match svc.read_file(caller, TAGS_FILE, root).await {
        Ok((_, FileContent::Text(text))) => Ok(Some(text)),
        Ok((_, FileContent::Binary(_))) => Ok(None),
        Err(VfsError::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

pub(crate) async fn extract<S: DocStore>(
    svc: &DocService<S>,
    caller: OwnerId,
    root: &str,
) -> Result<TagReport, VfsError> {
    let re = hashtag_re();
    let categories = match read_tags_file(svc, caller, root).await? {
        Some(content) => parse_categories(&re, &content),
        None => Vec::new(),
    };
    let mut union = BTreeSet::new();
    for cat in &categories {
        for t in &cat.tags {
            union.insert(t.clone());
        }
    }
    Ok(TagReport {
        tags: union.into_iter().collect(),
        categories,
    })
}

/// Walk the whole tree, depth-first, collecting hashtags from every
/// scannable file the caller can see.
async fn walk_collect<S: DocStore>(
    svc: &DocService<S>,
    caller: OwnerId,
    root: &str,
) -> Result<BTreeSet<String>, VfsError> {
    let re = hashtag_re();
    let mut found = BTreeSet::new();
    let mut pending: Vec<String> = vec![String::new()];
    while let Some(dir) = pending.pop() {
        let children = svc.tree(caller, &dir, root).await?;
        for child in children {
            if skip_name(&child.filename) {
                continue;
            }
            if child.is_directory {
                pending.push(child.full_path());
            } else if is_scannable_file(&child.filename) {
                if let Some(text) = &child.content_text {
                    collect_hashtags(&re, text, &mut found);
                }
            }
        }
    }
    Ok(found)
}

pub(crate) async fn scan_and_update<S: DocStore>(
    svc: &DocService<S>,
    caller: OwnerId,
    root: &str,
) -> Result<TagScanReport, VfsError> {
    let re = hashtag_re();

    // Phase 1: what .TAGS.md already knows.
    let content = read_tags_file(svc, caller, root).await?.unwrap_or_default();
    let mut existing = BTreeSet::new();
    collect_hashtags(&re, &content, &mut existing);

    // Phase 2: what the tree actually uses.
    let discovered = walk_collect(svc, caller, root).await?;
    let novel: Vec<String> = discovered.difference(&existing).cloned().collect();

    if !novel.is_empty() {
        let mut updated = content.clone();
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&format!("\n## {}\n\n{}\n", DISCOVERED_HEADING, novel.join(" ")));
        svc.save_file(caller, "", TAGS_FILE, root, &updated).await?;
    }

    tracing::info!(
        existing = existing.len(),
        new = novel.len(),
        "tag scan complete"
    );
    Ok(TagScanReport {
        existing_tags: existing.len(),
        new_tags: novel.len(),
        total_tags: existing.len() + novel.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use storage::SqliteVfs;

    const ROOT: &str = "main";
    const USER: OwnerId = 7;

    fn service() -> DocService<SqliteVfs> {
        DocService::new(Arc::new(SqliteVfs::memory().unwrap()))
    }

    #[test]
    fn headings_vs_hashtags() {
        assert_eq!(heading_text("## Topics"), Some("Topics"));
        assert_eq!(heading_text("#tag"), None);
        assert_eq!(heading_text("plain"), None);
        assert_eq!(heading_text("##"), Some(""));
    }

    #[test]
    fn parse_groups_by_heading() {
        let re = hashtag_re();
        let cats = parse_categories(
            &re,
            "# Work\n#project #deadline\n\n# Home\n#garden\n#garden #cooking\n",
        );
        assert_eq!(cats.len(), 2);
        assert_eq!(cats[0].heading, "Work");
        assert_eq!(cats[0].tags, vec!["#deadline", "#project"]);
        assert_eq!(cats[1].tags, vec!["#cooking", "#garden"]);
    }

    #[test]
    fn parse_tags_before_any_heading() {
        let re = hashtag_re();
        let cats = parse_categories(&re, "#stray\n# Real\n#tagged\n");
        assert_eq!(cats[0].heading, "");
        assert_eq!(cats[0].tags, vec!["#stray"]);
    }

    #[tokio::test]
    async fn extract_reads_tags_file() {
        let svc = service();
        svc.save_file(USER, "", TAGS_FILE, ROOT, "# A\n#one #two\n# B\n#two #three\n")
            .await
            .unwrap();
        let report = svc.extract_tags(USER, ROOT).await.unwrap();
        assert_eq!(report.tags, vec!["#one", "#three", "#two"]);
        assert_eq!(report.categories.len(), 2);
    }

    #[tokio::test]
    async fn extract_without_tags_file_is_empty() {
        let svc = service();
        let report = svc.extract_tags(USER, ROOT).await.unwrap();
        assert!(report.tags.is_empty());
        assert!(report.categories.is_empty());
    }

    #[tokio::test]
    async fn scan_appends_only_novel_tags() {
        let svc = service();
        svc.save_file(USER, "", TAGS_FILE, ROOT, "# Known\n#old\n")
            .await
            .unwrap();
        svc.save_file(USER, "", "note.md", ROOT, "uses #old and #fresh")
            .await
            .unwrap();
        svc.save_file(USER, "", "skip.py", ROOT, "#not-scanned")
            .await
            .unwrap();
        svc.create_folder(USER, "", "_private", ROOT, None).await.unwrap();
        svc.save_file(USER, "_private", "hidden.md", ROOT, "#secret")
            .await
            .unwrap();

        let report = svc.scan_and_update_tags(USER, ROOT).await.unwrap();
        assert_eq!(report.existing_tags, 1);
        assert_eq!(report.new_tags, 1);
        assert_eq!(report.total_tags, 2);

        let (_, content) = svc.read_file(USER, TAGS_FILE, ROOT).await.unwrap();
        let FileContent::Text(text) = content else {
            panic!("tags file must be text")
        };
        assert!(text.contains("## Discovered Tags"));
        assert!(text.contains("#fresh"));
        assert!(!text.contains("#secret"));

        // Idempotent: a second scan discovers nothing new.
        let again = svc.scan_and_update_tags(USER, ROOT).await.unwrap();
        assert_eq!(again.new_tags, 0);
    }
}
