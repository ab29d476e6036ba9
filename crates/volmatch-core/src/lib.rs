//! Core domain model for volunteer opportunity matching.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "volmatch-core";

pub const DEFAULT_PROFILE_NAME: &str = "Guest User";
pub const DEFAULT_PROFILE_INTERESTS: &[&str] = &["environment"];
pub const DEFAULT_ORGANIZER: &str = "Community Partner";

/// Stable catalog identifier of an opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpportunityId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("not an opportunity id: {0:?}")]
pub struct ParseIdError(pub String);

impl OpportunityId {
    /// Reads an id from a loosely typed JSON value. Numbers and numeric-looking
    /// strings map to the same id; anything else is rejected.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().and_then(integral_f64))
                .map(Self),
            JsonValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

fn integral_f64(value: f64) -> Option<u64> {
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 && value <= u64::MAX as f64 {
        Some(value as u64)
    } else {
        None
    }
}

impl FromStr for OpportunityId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(n) = trimmed.parse::<u64>() {
            return Ok(Self(n));
        }
        trimmed
            .parse::<f64>()
            .ok()
            .and_then(integral_f64)
            .map(Self)
            .ok_or_else(|| ParseIdError(s.to_string()))
    }
}

impl fmt::Display for OpportunityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for OpportunityId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Immutable catalog record describing a volunteer role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub id: OpportunityId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub interests: Vec<String>,
    #[serde(default)]
    pub organizer: Option<String>,
    #[serde(default, deserialize_with = "deserialize_calendar_date")]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub spots_left: Option<u32>,
}

impl Opportunity {
    pub fn organizer_label(&self) -> &str {
        self.organizer
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_ORGANIZER)
    }

    pub fn normalized_interests(&self) -> Vec<String> {
        self.interests.iter().map(|t| normalize_tag(t)).collect()
    }

    pub fn normalized_skills(&self) -> Vec<String> {
        self.skills.iter().map(|t| normalize_tag(t)).collect()
    }
}

fn deserialize_calendar_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_calendar_date))
}

/// Parses a date or date-time and keeps only the calendar date as written.
/// Time of day and any UTC offset are discarded, never applied.
pub fn parse_calendar_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.date_naive());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(ts.date());
        }
    }
    NaiveDate::parse_from_str(raw, "%b %d, %Y").ok()
}

/// Canonical comparison key for a tag: trimmed, inner whitespace collapsed, lowercased.
pub fn normalize_tag(tag: &str) -> String {
    tag.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn tags_equal(a: &str, b: &str) -> bool {
    normalize_tag(a) == normalize_tag(b)
}

/// Relatedness of two already-normalized tags: equal, or one is a prefix of a
/// word of the other ("environment" ~ "environmental work").
pub fn normalized_tags_related(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a == b || starts_word_of(a, b) || starts_word_of(b, a)
}

fn starts_word_of(needle: &str, haystack: &str) -> bool {
    std::iter::once(0)
        .chain(haystack.match_indices(' ').map(|(i, _)| i + 1))
        .any(|start| haystack[start..].starts_with(needle))
}

/// Case-insensitive lexical ordering used for display lists. Labels that only
/// differ by case fall back to a byte comparison so the order stays total.
pub fn display_cmp(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}

/// Ordered set of tag labels. Case is kept as entered; membership is
/// case-insensitive, so "Health" and "health" can never both be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct TagSet {
    labels: Vec<String>,
}

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits comma-separated editor input, dropping empty entries.
    pub fn parse_list(input: &str) -> Self {
        input.split(',').map(str::to_string).collect()
    }

    pub fn insert(&mut self, label: impl Into<String>) -> bool {
        let label = label.into();
        let label = label.trim();
        if label.is_empty() || self.contains(label) {
            return false;
        }
        self.labels.push(label.to_string());
        true
    }

    pub fn remove(&mut self, label: &str) -> bool {
        let key = normalize_tag(label);
        let before = self.labels.len();
        self.labels.retain(|l| normalize_tag(l) != key);
        self.labels.len() != before
    }

    pub fn contains(&self, label: &str) -> bool {
        let key = normalize_tag(label);
        self.labels.iter().any(|l| normalize_tag(l) == key)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn clear(&mut self) {
        self.labels.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn normalized(&self) -> Vec<String> {
        self.labels.iter().map(|l| normalize_tag(l)).collect()
    }

    /// Inserts every label of `other`, returning how many were new.
    pub fn merge(&mut self, other: &TagSet) -> usize {
        other.iter().filter(|l| self.insert(*l)).count()
    }
}

impl PartialEq for TagSet {
    fn eq(&self, other: &Self) -> bool {
        let mut a = self.normalized();
        let mut b = other.normalized();
        a.sort();
        b.sort();
        a == b
    }
}

impl Eq for TagSet {}

impl<S: Into<String>> FromIterator<S> for TagSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = Self::new();
        for label in iter {
            set.insert(label);
        }
        set
    }
}

impl From<Vec<String>> for TagSet {
    fn from(value: Vec<String>) -> Self {
        value.into_iter().collect()
    }
}

impl From<TagSet> for Vec<String> {
    fn from(value: TagSet) -> Self {
        value.labels
    }
}

/// User-declared interests and skills used for matching.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileTags {
    #[serde(default)]
    pub interests: TagSet,
    #[serde(default)]
    pub skills: TagSet,
}

impl ProfileTags {
    pub fn is_empty(&self) -> bool {
        self.interests.is_empty() && self.skills.is_empty()
    }

    pub fn merge(&mut self, other: &ProfileTags) -> usize {
        self.interests.merge(&other.interests) + self.skills.merge(&other.skills)
    }

    pub fn clear(&mut self) {
        self.interests.clear();
        self.skills.clear();
    }
}

/// Persisted per-user profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(flatten)]
    pub tags: ProfileTags,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            name: DEFAULT_PROFILE_NAME.to_string(),
            tags: ProfileTags {
                interests: DEFAULT_PROFILE_INTERESTS.iter().copied().collect(),
                skills: TagSet::new(),
            },
        }
    }
}

/// Known skills, interests and locations derived once from the catalog.
///
/// The first casing seen for a tag becomes its display label; the mapping is
/// fixed for the lifetime of the value.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TagCatalog {
    skills: Vec<String>,
    interests: Vec<String>,
    locations: Vec<String>,
    #[serde(skip)]
    skill_labels: BTreeMap<String, String>,
    #[serde(skip)]
    interest_labels: BTreeMap<String, String>,
}

impl TagCatalog {
    pub fn from_opportunities(opportunities: &[Opportunity]) -> Self {
        let skill_labels = first_seen_labels(opportunities.iter().flat_map(|o| o.skills.iter()));
        let interest_labels =
            first_seen_labels(opportunities.iter().flat_map(|o| o.interests.iter()));

        let mut locations: Vec<String> = Vec::new();
        for o in opportunities {
            let location = o.location.trim();
            if !location.is_empty() && !locations.iter().any(|l| l == &o.location) {
                locations.push(o.location.clone());
            }
        }
        locations.sort_by(|a, b| display_cmp(a, b));

        Self {
            skills: sorted_labels(&skill_labels),
            interests: sorted_labels(&interest_labels),
            locations,
            skill_labels,
            interest_labels,
        }
    }

    pub fn skills(&self) -> &[String] {
        &self.skills
    }

    pub fn interests(&self) -> &[String] {
        &self.interests
    }

    pub fn locations(&self) -> &[String] {
        &self.locations
    }

    pub fn canonical_skill(&self, tag: &str) -> Option<&str> {
        self.skill_labels.get(&normalize_tag(tag)).map(String::as_str)
    }

    pub fn canonical_interest(&self, tag: &str) -> Option<&str> {
        self.interest_labels.get(&normalize_tag(tag)).map(String::as_str)
    }
}

fn first_seen_labels<'a>(labels: impl Iterator<Item = &'a String>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for label in labels {
        let key = normalize_tag(label);
        if key.is_empty() {
            continue;
        }
        out.entry(key).or_insert_with(|| label.trim().to_string());
    }
    out
}

fn sorted_labels(labels: &BTreeMap<String, String>) -> Vec<String> {
    let mut out = labels.values().cloned().collect::<Vec<_>>();
    out.sort_by(|a, b| display_cmp(a, b));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn opp(id: u64, skills: &[&str], interests: &[&str], location: &str) -> Opportunity {
        Opportunity {
            id: OpportunityId(id),
            title: format!("Opportunity {id}"),
            description: String::new(),
            location: location.into(),
            skills: skills.iter().map(|s| s.to_string()).collect(),
            interests: interests.iter().map(|s| s.to_string()).collect(),
            organizer: None,
            start_date: None,
            spots_left: None,
        }
    }

    #[test]
    fn numeric_strings_and_numbers_are_the_same_id() {
        assert_eq!(OpportunityId::from_json(&json!(7)), Some(OpportunityId(7)));
        assert_eq!(OpportunityId::from_json(&json!("7")), Some(OpportunityId(7)));
        assert_eq!(OpportunityId::from_json(&json!(" 7 ")), Some(OpportunityId(7)));
        assert_eq!(OpportunityId::from_json(&json!(7.0)), Some(OpportunityId(7)));
        assert_eq!(OpportunityId::from_json(&json!("seven")), None);
        assert_eq!(OpportunityId::from_json(&json!(-1)), None);
        assert_eq!(OpportunityId::from_json(&json!(null)), None);
    }

    #[test]
    fn calendar_dates_ignore_time_and_offset() {
        let nov_15 = NaiveDate::from_ymd_opt(2025, 11, 15).unwrap();
        assert_eq!(parse_calendar_date("2025-11-15"), Some(nov_15));
        assert_eq!(parse_calendar_date("2025-11-15T00:00:00"), Some(nov_15));
        assert_eq!(parse_calendar_date("2025-11-15T23:59:59-08:00"), Some(nov_15));
        assert_eq!(parse_calendar_date("2025-11-15T00:30:00+09:00"), Some(nov_15));
        assert_eq!(parse_calendar_date("Nov 15, 2025"), Some(nov_15));
        assert_eq!(parse_calendar_date("soon"), None);
    }

    #[test]
    fn tag_set_is_case_insensitive_and_keeps_first_casing() {
        let mut tags = TagSet::parse_list("Health, health ,  , Youth");
        assert_eq!(tags.labels(), &["Health".to_string(), "Youth".to_string()]);
        assert!(!tags.insert("YOUTH"));
        assert!(tags.remove("youth"));
        assert!(tags.contains("HEALTH"));
        assert_eq!(tags.len(), 1);
    }

    #[test]
    fn tag_sets_compare_without_order_or_case() {
        let a: TagSet = ["Arts", "Youth"].into_iter().collect();
        let b: TagSet = ["youth", "ARTS"].into_iter().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn related_tags_match_on_word_prefixes() {
        assert!(normalized_tags_related("environment", "environmental work"));
        assert!(normalized_tags_related("environmental work", "environment"));
        assert!(normalized_tags_related("health", "mental health"));
        assert!(!normalized_tags_related("art", "heart"));
        assert!(!normalized_tags_related("", "health"));
    }

    #[test]
    fn tag_catalog_dedupes_and_sorts_with_first_seen_labels() {
        let catalog = TagCatalog::from_opportunities(&[
            opp(1, &["Teamwork", "leadership"], &["Health"], "City Center"),
            opp(2, &["Leadership", "communication"], &["health", "Arts"], "Art Center"),
            opp(3, &["teamwork"], &[], "City Center"),
        ]);
        assert_eq!(catalog.skills(), &["communication", "leadership", "Teamwork"]);
        assert_eq!(catalog.interests(), &["Arts", "Health"]);
        assert_eq!(catalog.locations(), &["Art Center", "City Center"]);
        assert_eq!(catalog.canonical_skill("LEADERSHIP"), Some("leadership"));
        assert_eq!(catalog.canonical_interest("unknown"), None);
    }

    #[test]
    fn profile_round_trips_with_flat_tag_fields() {
        let profile = Profile::default();
        let value = serde_json::to_value(&profile).unwrap();
        assert_eq!(
            value,
            json!({"name": "Guest User", "interests": ["environment"], "skills": []})
        );
    }

    #[test]
    fn opportunity_reads_camel_case_and_lenient_dates() {
        let parsed: Opportunity = serde_json::from_value(json!({
            "id": 4,
            "title": "Animal Shelter Assistant",
            "startDate": "2025-12-01T09:00:00+08:00",
            "spotsLeft": 3
        }))
        .unwrap();
        assert_eq!(parsed.start_date, NaiveDate::from_ymd_opt(2025, 12, 1));
        assert_eq!(parsed.spots_left, Some(3));
        assert_eq!(parsed.organizer_label(), DEFAULT_ORGANIZER);
    }
}
