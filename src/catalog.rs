use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::challenge::{parse_challenge, ChallengeSpec, Difficulty};
use crate::error::{io_context, ForgeError};

#[derive(Debug, Clone)]
struct CatalogEntry {
    spec: ChallengeSpec,
    path: PathBuf,
}

/// Read-only view of every valid challenge definition.
///
/// Broken or duplicate definitions are collected in `rejected` instead of
/// failing the whole load.
#[derive(Debug, Default)]
pub(crate) struct ChallengeCatalog {
    entries: Vec<CatalogEntry>,
    rejected: Vec<ForgeError>,
}

impl ChallengeCatalog {
    pub(crate) fn load(dir: &Path) -> Result<Self, ForgeError> {
        let listing = match fs::read_dir(dir) {
            Ok(listing) => listing,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(ForgeError::Io {
                    context: format!("Failed to list challenges in {}", dir.display()),
                    source: err,
                })
            }
        };
        let mut paths = Vec::new();
        for entry in listing {
            let entry =
                entry.map_err(io_context(format!("Failed to list {}", dir.display())))?;
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if is_yaml && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut sources = Vec::with_capacity(paths.len());
        let mut unreadable = Vec::new();
        for path in paths {
            match fs::read_to_string(&path) {
                Ok(text) => sources.push((path, text)),
                Err(err) => unreadable.push(ForgeError::InvalidChallengeDefinition {
                    reason: format!("unreadable: {}", err),
                    path,
                }),
            }
        }
        let mut catalog = Self::from_sources(sources);
        catalog.rejected.extend(unreadable);
        Ok(catalog)
    }

    /// Builds a catalog from `(path, yaml)` pairs in the given order; the first
    /// definition of an id wins.
    pub(crate) fn from_sources(sources: impl IntoIterator<Item = (PathBuf, String)>) -> Self {
        let mut catalog = Self::default();
        let mut seen: HashMap<String, PathBuf> = HashMap::new();
        for (path, text) in sources {
            match parse_challenge(&path, &text) {
                Ok(spec) => {
                    if let Some(first) = seen.get(&spec.id) {
                        catalog.rejected.push(ForgeError::DuplicateChallenge {
                            id: spec.id.clone(),
                            path,
                            first: first.clone(),
                        });
                        continue;
                    }
                    seen.insert(spec.id.clone(), path.clone());
                    catalog.entries.push(CatalogEntry { spec, path });
                }
                Err(err) => catalog.rejected.push(err),
            }
        }
        catalog
    }

    pub(crate) fn list(&self) -> impl Iterator<Item = &ChallengeSpec> {
        self.entries.iter().map(|entry| &entry.spec)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn get(&self, id: &str) -> Result<&ChallengeSpec, ForgeError> {
        self.entries
            .iter()
            .find(|entry| entry.spec.id == id)
            .map(|entry| &entry.spec)
            .ok_or_else(|| ForgeError::ChallengeNotFound(id.to_string()))
    }

    pub(crate) fn source_path(&self, id: &str) -> Option<&Path> {
        self.entries
            .iter()
            .find(|entry| entry.spec.id == id)
            .map(|entry| entry.path.as_path())
    }

    /// Challenges matching the difficulty (when given) and carrying every tag.
    pub(crate) fn filter(
        &self,
        difficulty: Option<Difficulty>,
        tags: &[String],
    ) -> Vec<&ChallengeSpec> {
        self.list()
            .filter(|spec| difficulty.map_or(true, |wanted| spec.difficulty == wanted))
            .filter(|spec| {
                tags.iter()
                    .all(|tag| spec.tags.iter().any(|have| have.eq_ignore_ascii_case(tag)))
            })
            .collect()
    }

    /// Random challenge that is not completed yet. When the difficulty filter
    /// leaves nothing, any open challenge is considered instead.
    pub(crate) fn pick<R: Rng + ?Sized>(
        &self,
        difficulty: Option<Difficulty>,
        is_completed: impl Fn(&str) -> bool,
        rng: &mut R,
    ) -> Option<&ChallengeSpec> {
        let open: Vec<&ChallengeSpec> = self
            .filter(difficulty, &[])
            .into_iter()
            .filter(|spec| !is_completed(&spec.id))
            .collect();
        if let Some(spec) = open.choose(rng).copied() {
            return Some(spec);
        }
        let fallback: Vec<&ChallengeSpec> =
            self.list().filter(|spec| !is_completed(&spec.id)).collect();
        fallback.choose(rng).copied()
    }

    pub(crate) fn rejected(&self) -> &[ForgeError] {
        &self.rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::TempDir;

    fn definition(id: &str, difficulty: &str, tags: &str) -> String {
        format!(
            "id: {id}\ntitle: Title {id}\nrepo: octo/widgets\ndifficulty: {difficulty}\n\
             setup:\n  base_commit: a1\n  solution_commit: b2\ntags: [{tags}]\n"
        )
    }

    fn sample_catalog() -> ChallengeCatalog {
        ChallengeCatalog::from_sources(vec![
            (PathBuf::from("a.yaml"), definition("easy-1", "easy", "parsing")),
            (PathBuf::from("b.yaml"), definition("hard-1", "hard", "parsing, io")),
            (PathBuf::from("c.yaml"), definition("hard-2", "hard", "io")),
        ])
    }

    #[test]
    fn duplicate_id_keeps_first_definition() {
        let catalog = ChallengeCatalog::from_sources(vec![
            (PathBuf::from("one.yaml"), definition("demo-001", "easy", "")),
            (PathBuf::from("two.yaml"), definition("demo-001", "hard", "")),
        ]);
        assert_eq!(catalog.len(), 1);
        let spec = catalog.get("demo-001").expect("first definition usable");
        assert_eq!(spec.difficulty, Difficulty::Easy);
        assert_eq!(catalog.source_path("demo-001"), Some(Path::new("one.yaml")));
        match catalog.rejected() {
            [ForgeError::DuplicateChallenge { id, path, first }] => {
                assert_eq!(id, "demo-001");
                assert_eq!(path, &PathBuf::from("two.yaml"));
                assert_eq!(first, &PathBuf::from("one.yaml"));
            }
            other => panic!("unexpected rejections: {other:?}"),
        }
    }

    #[test]
    fn invalid_entry_does_not_block_others() {
        let catalog = ChallengeCatalog::from_sources(vec![
            (PathBuf::from("bad.yaml"), "id: broken\ntitle: x\n".to_string()),
            (PathBuf::from("good.yaml"), definition("good-1", "easy", "")),
        ]);
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get("good-1").is_ok());
        assert!(matches!(
            catalog.rejected(),
            [ForgeError::InvalidChallengeDefinition { .. }]
        ));
    }

    #[test]
    fn get_unknown_is_not_found() {
        let err = sample_catalog().get("nope").expect_err("missing");
        assert!(matches!(err, ForgeError::ChallengeNotFound(id) if id == "nope"));
    }

    #[test]
    fn filter_by_difficulty_and_tags() {
        let catalog = sample_catalog();
        let hard: Vec<&str> = catalog
            .filter(Some(Difficulty::Hard), &[])
            .iter()
            .map(|spec| spec.id.as_str())
            .collect();
        assert_eq!(hard, vec!["hard-1", "hard-2"]);
        let parsing_io: Vec<&str> = catalog
            .filter(None, &["parsing".to_string(), "IO".to_string()])
            .iter()
            .map(|spec| spec.id.as_str())
            .collect();
        assert_eq!(parsing_io, vec!["hard-1"]);
    }

    #[test]
    fn pick_skips_completed_and_falls_back() {
        let catalog = sample_catalog();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..10 {
            let spec = catalog
                .pick(Some(Difficulty::Hard), |id| id == "hard-1", &mut rng)
                .expect("one hard challenge open");
            assert_eq!(spec.id, "hard-2");
        }
        let spec = catalog
            .pick(Some(Difficulty::Hard), |id| id.starts_with("hard"), &mut rng)
            .expect("fallback to any open challenge");
        assert_eq!(spec.id, "easy-1");
        assert!(catalog.pick(None, |_| true, &mut rng).is_none());
    }

    #[test]
    fn load_reads_yaml_files_in_name_order() {
        let temp = TempDir::new().expect("temp dir");
        fs::write(temp.path().join("b.yml"), definition("dup", "hard", "")).expect("write b");
        fs::write(temp.path().join("a.yaml"), definition("dup", "easy", "")).expect("write a");
        fs::write(temp.path().join("notes.txt"), "ignored").expect("write txt");
        let catalog = ChallengeCatalog::load(temp.path()).expect("load");
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("dup").expect("dup").difficulty, Difficulty::Easy);
        assert_eq!(catalog.rejected().len(), 1);

        let missing = ChallengeCatalog::load(&temp.path().join("absent")).expect("missing dir");
        assert!(missing.is_empty());
    }

    #[test]
    fn unreadable_file_is_rejected_without_losing_others() {
        let temp = TempDir::new().expect("temp dir");
        fs::write(temp.path().join("a_good.yaml"), definition("good-1", "easy", ""))
            .expect("write good");
        fs::write(temp.path().join("b_bad.yaml"), b"title: \xff\xfe\n").expect("write bad");
        let catalog = ChallengeCatalog::load(temp.path()).expect("load");
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get("good-1").is_ok());
        match catalog.rejected() {
            [ForgeError::InvalidChallengeDefinition { path, reason }] => {
                assert!(path.ends_with("b_bad.yaml"), "{}", path.display());
                assert!(reason.contains("unreadable"), "{reason}");
            }
            other => panic!("unexpected rejections: {other:?}"),
        }
    }
}
