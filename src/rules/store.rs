//! Rule store loading and hot-reload.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use semver::Version;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::RuleStoreError;
use crate::plan::OperationKind;

/// Markdown section files a preset directory may carry.
///
/// Order matters: it is the concatenation order used by the prompt builder.
const SECTION_FILES: [(&str, fn(&mut RuleSet) -> &mut String); 9] = [
    ("base_rules.md", |r| &mut r.base_rules),
    ("manufacturing.md", |r| &mut r.manufacturing),
    ("dimension_guidance.md", |r| &mut r.dimension_guidance),
    ("failure_prevention.md", |r| &mut r.failure_prevention),
    ("anti_patterns.md", |r| &mut r.anti_patterns),
    ("api_reference.md", |r| &mut r.api_reference),
    ("design_patterns.md", |r| &mut r.design_patterns),
    ("operation_interactions.md", |r| &mut r.operation_interactions),
    ("few_shot_examples.md", |r| &mut r.few_shot_examples),
];

/// A cookbook recipe: a known-good script for a named shape family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookbookRecipe {
    /// Human-readable recipe title.
    pub title: String,
    /// Complete CadQuery source.
    pub code: String,
    /// Operations the recipe exercises.
    #[serde(default)]
    pub operations: Vec<OperationKind>,
    /// Minimum CadQuery version the recipe requires.
    #[serde(default)]
    pub min_library_version: Option<String>,
}

impl CookbookRecipe {
    /// Whether the recipe is usable with the installed library version.
    pub fn supports_version(&self, installed: &Version) -> bool {
        match &self.min_library_version {
            None => true,
            Some(min) => match Version::parse(min) {
                Ok(min) => *installed >= min,
                // An unparseable constraint disables the recipe.
                Err(_) => false,
            },
        }
    }
}

/// One loaded preset of the knowledge base.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    /// Preset identifier this set was loaded from.
    pub preset_id: String,
    pub base_rules: String,
    pub manufacturing: String,
    pub dimension_guidance: String,
    pub failure_prevention: String,
    pub cookbook: Vec<CookbookRecipe>,
    pub anti_patterns: String,
    pub api_reference: String,
    pub design_patterns: String,
    pub operation_interactions: String,
    pub few_shot_examples: String,
}

impl RuleSet {
    /// Recipes usable with the installed library version.
    pub fn cookbook_for_version(&self, installed: &Version) -> Vec<&CookbookRecipe> {
        self.cookbook
            .iter()
            .filter(|recipe| recipe.supports_version(installed))
            .collect()
    }
}

/// The rule store: preset directories under a common root.
///
/// Loaded presets are cached behind `RwLock<Arc<RuleSet>>`; readers clone
/// the `Arc` and never observe a partially applied reload.
pub struct RuleStore {
    root: PathBuf,
    cache: RwLock<HashMap<String, Arc<RuleSet>>>,
}

impl RuleStore {
    /// Creates a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// The store root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Loads a preset, reading from disk on first access.
    ///
    /// # Errors
    ///
    /// Returns `RuleStoreError::PresetNotFound` if the preset directory
    /// does not exist, or a parse error for a malformed cookbook.
    pub fn load(&self, preset_id: &str) -> Result<Arc<RuleSet>, RuleStoreError> {
        {
            let cache = self.cache.read().expect("rule cache poisoned");
            if let Some(rules) = cache.get(preset_id) {
                return Ok(Arc::clone(rules));
            }
        }
        self.reload(preset_id)
    }

    /// Re-reads a preset from disk and swaps it into the cache atomically.
    pub fn reload(&self, preset_id: &str) -> Result<Arc<RuleSet>, RuleStoreError> {
        let rules = Arc::new(self.read_preset(preset_id)?);

        let mut cache = self.cache.write().expect("rule cache poisoned");
        cache.insert(preset_id.to_string(), Arc::clone(&rules));

        tracing::info!(
            preset = preset_id,
            recipes = rules.cookbook.len(),
            "Loaded rule preset"
        );
        Ok(rules)
    }

    /// Lists preset directories present under the root.
    pub fn available_presets(&self) -> Vec<String> {
        let mut presets: Vec<String> = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_dir())
            .filter_map(|entry| entry.file_name().to_str().map(String::from))
            .collect();
        presets.sort();
        presets
    }

    fn read_preset(&self, preset_id: &str) -> Result<RuleSet, RuleStoreError> {
        let dir = self.root.join(preset_id);
        if !dir.is_dir() {
            return Err(RuleStoreError::PresetNotFound(preset_id.to_string()));
        }

        let mut rules = RuleSet {
            preset_id: preset_id.to_string(),
            ..RuleSet::default()
        };

        for (file, field) in SECTION_FILES {
            let path = dir.join(file);
            if path.is_file() {
                *field(&mut rules) = std::fs::read_to_string(&path)?.trim().to_string();
            }
        }

        let cookbook_path = dir.join("cookbook.yaml");
        if cookbook_path.is_file() {
            let raw = std::fs::read_to_string(&cookbook_path)?;
            rules.cookbook = serde_yaml::from_str(&raw).map_err(|e| {
                RuleStoreError::CookbookParse {
                    path: cookbook_path.display().to_string(),
                    message: e.to_string(),
                }
            })?;
        }

        Ok(rules)
    }
}
