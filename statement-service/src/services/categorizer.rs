//! Transaction categorization.
//!
//! Strategies are tried in a fixed order and the first that answers wins:
//! user merchant rules, categories learned from recurring charges, receipt
//! keywords, then the default category.

use crate::models::{
    CategorySource, DocumentKind, MatchType, MerchantRule, ProfileType, RecurringCharge,
    Statement, Transaction, TransactionSource,
};
use crate::services::normalizer::NormalizedTransaction;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use uuid::Uuid;

pub const DEFAULT_CATEGORY: &str = "Uncategorized";

/// Shortest merchant key allowed to match by containment.
const MIN_KEY_LEN: usize = 3;

const GROCERY_KEYWORDS: &[&str] = &[
    "grocery",
    "supermarket",
    "whole foods",
    "trader joe",
    "kroger",
    "safeway",
    "aldi",
    "publix",
    "wegmans",
    "sprouts",
    "costco",
];

const RETAIL_KEYWORDS: &[&str] = &[
    "walmart",
    "target",
    "amazon",
    "best buy",
    "home depot",
    "ikea",
    "macy",
    "macys",
    "ebay",
    "etsy",
];

/// Whole-word, case-insensitive alternation over `keywords`.
fn keyword_regex(keywords: &[&str]) -> Regex {
    let alternation = keywords
        .iter()
        .map(|k| regex::escape(k))
        .collect::<Vec<_>>()
        .join("|");
    RegexBuilder::new(&format!(r"\b(?:{})\b", alternation))
        .case_insensitive(true)
        .build()
        .expect("valid keyword regex")
}

static GROCERY_MATCHER: Lazy<Regex> = Lazy::new(|| keyword_regex(GROCERY_KEYWORDS));
static RETAIL_MATCHER: Lazy<Regex> = Lazy::new(|| keyword_regex(RETAIL_KEYWORDS));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryMatch {
    pub category: String,
    pub source: CategorySource,
}

impl CategoryMatch {
    fn new(category: impl Into<String>, source: CategorySource) -> Self {
        Self {
            category: category.into(),
            source,
        }
    }
}

pub trait CategoryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn try_match(&self, txn: &NormalizedTransaction) -> Option<CategoryMatch>;
}

// ============================================================================
// Merchant Rules
// ============================================================================

struct CompiledRule {
    rule: MerchantRule,
    pattern: String,
    regex: Option<Regex>,
}

impl CompiledRule {
    fn matches(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        match self.rule.match_type {
            MatchType::Contains => text.contains(&self.pattern),
            MatchType::StartsWith => text.starts_with(&self.pattern),
            MatchType::Exact => text == self.pattern,
            MatchType::Regex => self.regex.as_ref().is_some_and(|re| re.is_match(&text)),
        }
    }
}

pub struct MerchantRuleStrategy {
    rules: Vec<CompiledRule>,
}

impl MerchantRuleStrategy {
    /// Keep the active rules that apply to `profile_type`, highest priority
    /// first and newest first among equal priorities.
    pub fn new(rules: Vec<MerchantRule>, profile_type: ProfileType) -> Self {
        let mut applicable: Vec<MerchantRule> = rules
            .into_iter()
            .filter(|r| r.is_active && r.profile_type.map_or(true, |p| p == profile_type))
            .collect();
        applicable.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });

        let rules = applicable
            .into_iter()
            .filter_map(|rule| {
                let regex = match rule.match_type {
                    MatchType::Regex => match RegexBuilder::new(&rule.pattern)
                        .case_insensitive(true)
                        .build()
                    {
                        Ok(re) => Some(re),
                        Err(e) => {
                            tracing::warn!(rule_id = %rule.id, error = %e, "Skipping merchant rule with invalid regex");
                            return None;
                        }
                    },
                    _ => None,
                };
                Some(CompiledRule {
                    pattern: rule.pattern.to_lowercase(),
                    rule,
                    regex,
                })
            })
            .collect();

        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl CategoryStrategy for MerchantRuleStrategy {
    fn name(&self) -> &'static str {
        "merchant_rule"
    }

    fn try_match(&self, txn: &NormalizedTransaction) -> Option<CategoryMatch> {
        self.rules
            .iter()
            .find(|r| r.matches(&txn.merchant) || r.matches(&txn.description))
            .map(|r| CategoryMatch::new(r.rule.category.clone(), CategorySource::Rule))
    }
}

// ============================================================================
// Recurring Charges
// ============================================================================

pub struct RecurringPatternStrategy {
    /// `(merchant_key, category)`, longest key first.
    patterns: Vec<(String, String)>,
}

impl RecurringPatternStrategy {
    pub fn new(charges: &[RecurringCharge]) -> Self {
        let mut patterns: Vec<(String, String)> = charges
            .iter()
            .filter(|c| c.is_active && !c.merchant_key.is_empty())
            .filter_map(|c| {
                c.category
                    .as_ref()
                    .map(|category| (c.merchant_key.clone(), category.clone()))
            })
            .collect();
        patterns.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { patterns }
    }
}

impl CategoryStrategy for RecurringPatternStrategy {
    fn name(&self) -> &'static str {
        "recurring_pattern"
    }

    fn try_match(&self, txn: &NormalizedTransaction) -> Option<CategoryMatch> {
        let key = txn.merchant_key.as_str();
        if key.is_empty() {
            return None;
        }
        self.patterns
            .iter()
            .find(|(pattern, _)| {
                pattern == key
                    || (pattern.len() >= MIN_KEY_LEN && key.contains(pattern.as_str()))
                    || (key.len() >= MIN_KEY_LEN && pattern.contains(key))
            })
            .map(|(_, category)| CategoryMatch::new(category.clone(), CategorySource::Recurring))
    }
}

// ============================================================================
// Receipt Keywords
// ============================================================================

pub struct KeywordStrategy;

impl CategoryStrategy for KeywordStrategy {
    fn name(&self) -> &'static str {
        "keyword"
    }

    fn try_match(&self, txn: &NormalizedTransaction) -> Option<CategoryMatch> {
        let text = format!("{} {}", txn.merchant, txn.description);
        if GROCERY_MATCHER.is_match(&text) {
            return Some(CategoryMatch::new("Groceries", CategorySource::Keyword));
        }
        if RETAIL_MATCHER.is_match(&text) {
            return Some(CategoryMatch::new("Shopping", CategorySource::Keyword));
        }
        None
    }
}

pub struct DefaultStrategy;

impl CategoryStrategy for DefaultStrategy {
    fn name(&self) -> &'static str {
        "default"
    }

    fn try_match(&self, _txn: &NormalizedTransaction) -> Option<CategoryMatch> {
        Some(CategoryMatch::new(DEFAULT_CATEGORY, CategorySource::Default))
    }
}

// ============================================================================
// Chain
// ============================================================================

pub struct Categorizer {
    strategies: Vec<Box<dyn CategoryStrategy>>,
}

impl Categorizer {
    pub fn new(strategies: Vec<Box<dyn CategoryStrategy>>) -> Self {
        Self { strategies }
    }

    /// The standard chain for one statement. Keyword matching is only used
    /// for receipts.
    pub fn for_statement(
        statement: &Statement,
        rules: Vec<MerchantRule>,
        recurring: &[RecurringCharge],
    ) -> Self {
        let mut strategies: Vec<Box<dyn CategoryStrategy>> = vec![
            Box::new(MerchantRuleStrategy::new(rules, statement.profile_type)),
            Box::new(RecurringPatternStrategy::new(recurring)),
        ];
        if statement.document_kind == DocumentKind::Receipt {
            strategies.push(Box::new(KeywordStrategy));
        }
        strategies.push(Box::new(DefaultStrategy));
        Self::new(strategies)
    }

    pub fn categorize(&self, txn: &NormalizedTransaction) -> CategoryMatch {
        self.strategies
            .iter()
            .find_map(|s| {
                let found = s.try_match(txn)?;
                tracing::trace!(strategy = s.name(), category = %found.category, "Categorized");
                Some(found)
            })
            .unwrap_or_else(|| CategoryMatch::new(DEFAULT_CATEGORY, CategorySource::Default))
    }

    /// Categorize a normalized batch into ledger entries owned by `statement`.
    pub fn apply(
        &self,
        statement: &Statement,
        batch: Vec<NormalizedTransaction>,
    ) -> Vec<Transaction> {
        let now = Utc::now();
        batch
            .into_iter()
            .map(|txn| {
                let found = self.categorize(&txn);
                Transaction {
                    id: Uuid::new_v4(),
                    user_id: statement.user_id,
                    profile_id: statement.profile_id,
                    statement_id: Some(statement.id),
                    date: txn.date,
                    amount: txn.amount,
                    description: txn.description,
                    merchant: txn.merchant,
                    category: found.category,
                    transaction_type: txn.transaction_type,
                    source: TransactionSource::StatementImport,
                    categorized_by: found.source,
                    reference: txn.reference,
                    created_at: now,
                }
            })
            .collect()
    }
}
