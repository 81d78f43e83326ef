// Classifier module
// Assigns a coarse topical category to a chunk by ordered keyword rules


use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

pub const UNCATEGORIZED: &str = "uncategorized";

/// One keyword rule; the first rule with any matching keyword wins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub category: String,
    pub keywords: Vec<String>,
}

impl CategoryRule {
    fn new(category: &str, keywords: &[&str]) -> Self {
        Self {
            category: category.to_string(),
            keywords: keywords.iter().map(|k| (*k).to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub default_category: String,
    pub rules: Vec<CategoryRule>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            default_category: UNCATEGORIZED.to_string(),
            rules: vec![
                CategoryRule::new("rental", &["rental", "rent", "lease", "대여", "임대", "렌탈"]),
                CategoryRule::new("repair", &["repair", "maintenance", "수리", "정비", "보수"]),
                CategoryRule::new(
                    "application",
                    &["application", "apply", "request form", "신청", "접수"],
                ),
                CategoryRule::new(
                    "eligibility",
                    &["eligib", "qualif", "자격", "대상자", "요건"],
                ),
                CategoryRule::new(
                    "fees",
                    &["fee", "cost", "payment", "charge", "비용", "요금", "납부"],
                ),
                CategoryRule::new(
                    "penalty",
                    &["penalty", "violation", "sanction", "위반", "제재", "벌칙"],
                ),
            ],
        }
    }
}

impl ClassifierConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_category.trim().is_empty() {
            return Err(ConfigError::EmptyCategory);
        }

        for rule in &self.rules {
            if rule.category.trim().is_empty() {
                return Err(ConfigError::EmptyCategory);
            }
            if rule.keywords.iter().all(|k| k.trim().is_empty()) {
                return Err(ConfigError::EmptyClassifierRule(rule.category.clone()));
            }
        }

        Ok(())
    }

    /// Classify a chunk from its title and content.
    ///
    /// Matching is case-insensitive over `title + content`. ASCII keywords
    /// must start at a word boundary ("rent" matches "rental" but not
    /// "current"); other keywords match anywhere since Korean compounds
    /// attach without spaces.
    #[inline]
    pub fn classify(&self, title: &str, content: &str) -> String {
        let haystack = format!("{} {}", title, content).to_lowercase();

        self.rules
            .iter()
            .find(|rule| {
                rule.keywords
                    .iter()
                    .map(|k| k.trim())
                    .filter(|k| !k.is_empty())
                    .any(|k| contains_keyword(&haystack, &k.to_lowercase()))
            })
            .map_or_else(
                || self.default_category.clone(),
                |rule| rule.category.clone(),
            )
    }
}

fn contains_keyword(haystack: &str, keyword: &str) -> bool {
    if !keyword.is_ascii() {
        return haystack.contains(keyword);
    }

    haystack.match_indices(keyword).any(|(idx, _)| {
        haystack
            .get(..idx)
            .and_then(|before| before.chars().next_back())
            .is_none_or(|c| !c.is_alphanumeric())
    })
}
