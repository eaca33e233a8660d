//! Budget data model: the synchronizable `ApplicationState` and its parts.
//!
//! Every mutation produces a brand-new snapshot, so two states are the same
//! exactly when their serialized forms are the same. [`Fingerprint`] captures
//! that serialized form and is what the sync engine compares.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

use crate::schema::CURRENT_SCHEMA_VERSION;

/// The full synchronizable payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationState {
    /// Schema version this snapshot was written with
    pub schema_version: u32,
    /// Ordered list of monthly budget sheets
    pub sheets: Vec<Sheet>,
    /// Reusable category layouts
    pub templates: Vec<Template>,
    /// Sheets archived out of the active list
    pub history: Vec<HistoryEntry>,
    /// Sheet currently shown to the user
    pub active_sheet_id: Option<String>,
    pub view_mode: ViewMode,
    /// Free-text notes
    pub notes: String,
    /// Currency exchange rate used for display conversion
    pub exchange_rate: f64,
    pub rate_meta: Option<RateMeta>,
}

impl Default for ApplicationState {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            sheets: Vec::new(),
            templates: Vec::new(),
            history: Vec::new(),
            active_sheet_id: None,
            view_mode: ViewMode::default(),
            notes: String::new(),
            exchange_rate: 1.0,
            rate_meta: None,
        }
    }
}

impl ApplicationState {
    /// Empty state, as created on first run.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Serialized fingerprint of this snapshot.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint(
            serde_json::to_string(self).expect("ApplicationState serialization should not fail"),
        )
    }

    pub fn has_sheets(&self) -> bool {
        !self.sheets.is_empty()
    }

    pub fn sheet(&self, sheet_id: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.id == sheet_id)
    }

    pub fn active_sheet(&self) -> Option<&Sheet> {
        self.active_sheet_id.as_deref().and_then(|id| self.sheet(id))
    }
}

/// A monthly budget container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sheet {
    pub id: String,
    pub name: String,
    /// Budget month as `YYYY-MM`, if the sheet is tied to one
    pub month: Option<String>,
    /// Creation time in milliseconds since epoch
    pub created_at: i64,
    pub categories: Vec<Category>,
    pub marks: Vec<Mark>,
    pub balances: Vec<Balance>,
}

impl Sheet {
    /// Sum of all category budgets.
    pub fn budgeted(&self) -> f64 {
        self.categories.iter().map(|c| c.amount).sum()
    }

    /// Net of completed marks (incoming minus outgoing).
    pub fn settled(&self) -> f64 {
        self.marks
            .iter()
            .filter(|m| m.status == MarkStatus::Completed)
            .map(Mark::signed_amount)
            .sum()
    }

    /// Net of marks still pending.
    pub fn outstanding(&self) -> f64 {
        self.marks
            .iter()
            .filter(|m| m.status == MarkStatus::Pending)
            .map(Mark::signed_amount)
            .sum()
    }
}

/// A budget bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    pub name: String,
    pub amount: f64,
}

/// A tracked incoming or outgoing transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mark {
    pub id: String,
    pub title: String,
    pub amount: f64,
    pub direction: Direction,
    pub status: MarkStatus,
    pub category_id: Option<String>,
    pub balance_id: Option<String>,
    /// Due date as `YYYY-MM-DD`
    pub due_date: Option<String>,
}

impl Mark {
    /// Amount with sign applied: incoming is positive, outgoing negative.
    pub fn signed_amount(&self) -> f64 {
        match self.direction {
            Direction::Incoming => self.amount,
            Direction::Outgoing => -self.amount,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Incoming,
    #[default]
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MarkStatus {
    #[default]
    Pending,
    Completed,
}

/// An account snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub id: String,
    pub name: String,
    pub amount: f64,
    pub currency: String,
}

/// A reusable category layout for new sheets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: String,
    pub name: String,
    pub categories: Vec<Category>,
}

/// A sheet that was archived out of the active list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    /// When the sheet was archived, in milliseconds since epoch
    pub archived_at: i64,
    pub sheet: Sheet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ViewMode {
    #[default]
    Sheet,
    Summary,
}

/// Where the exchange rate came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateMeta {
    pub source: String,
    /// When the rate was fetched, in milliseconds since epoch
    pub fetched_at: i64,
}

/// Serialized form of an [`ApplicationState`], used for freshness checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Error)]
pub enum UserIdError {
    #[error("User ID cannot be empty")]
    Empty,
}

/// Stable identifier supplied by the authenticated-identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Result<Self, UserIdError> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            Err(UserIdError::Empty)
        } else {
            Ok(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for UserId {
    type Err = UserIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for UserId {
    type Error = UserIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sheet() -> Sheet {
        Sheet {
            id: "s1".into(),
            name: "May".into(),
            month: Some("2024-05".into()),
            created_at: 1_000,
            categories: vec![
                Category {
                    id: "c1".into(),
                    name: "Rent".into(),
                    amount: 900.0,
                },
                Category {
                    id: "c2".into(),
                    name: "Food".into(),
                    amount: 300.0,
                },
            ],
            marks: vec![
                Mark {
                    id: "m1".into(),
                    title: "Salary".into(),
                    amount: 2000.0,
                    direction: Direction::Incoming,
                    status: MarkStatus::Completed,
                    category_id: None,
                    balance_id: None,
                    due_date: None,
                },
                Mark {
                    id: "m2".into(),
                    title: "Rent".into(),
                    amount: 900.0,
                    direction: Direction::Outgoing,
                    status: MarkStatus::Pending,
                    category_id: Some("c1".into()),
                    balance_id: None,
                    due_date: Some("2024-05-01".into()),
                },
            ],
            balances: vec![],
        }
    }

    #[test]
    fn test_equal_states_share_fingerprint() {
        let a = ApplicationState::empty();
        let b = ApplicationState::empty();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let mut c = ApplicationState::empty();
        c.notes = "hello".into();
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_state_serializes_camel_case() {
        let mut state = ApplicationState::empty();
        state.active_sheet_id = Some("s1".into());
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"schemaVersion\":2"));
        assert!(json.contains("\"activeSheetId\":\"s1\""));
        assert!(json.contains("\"viewMode\":\"sheet\""));
        assert!(json.contains("\"exchangeRate\":1.0"));
    }

    #[test]
    fn test_sheet_totals() {
        let sheet = sample_sheet();
        assert_eq!(sheet.budgeted(), 1200.0);
        assert_eq!(sheet.settled(), 2000.0);
        assert_eq!(sheet.outstanding(), -900.0);
    }

    #[test]
    fn test_active_sheet_lookup() {
        let mut state = ApplicationState::empty();
        state.sheets.push(sample_sheet());
        assert!(state.active_sheet().is_none());

        state.active_sheet_id = Some("s1".into());
        assert_eq!(state.active_sheet().map(|s| s.name.as_str()), Some("May"));
    }

    #[test]
    fn test_user_id_rejects_empty() {
        assert!(UserId::new("").is_err());
        assert!(UserId::new("   ").is_err());
        assert_eq!(UserId::new(" alice ").unwrap().as_str(), "alice");
    }

    #[test]
    fn test_user_id_serde_roundtrip_validates() {
        let id: UserId = serde_json::from_str("\"bob\"").unwrap();
        assert_eq!(id.to_string(), "bob");
        assert!(serde_json::from_str::<UserId>("\"\"").is_err());
    }
}
