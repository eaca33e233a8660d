//! State transitions for the budget model.
//!
//! `reduce` is pure: it never mutates its input, and ids and timestamps
//! arrive inside the action. Actions that reference unknown ids return an
//! identical snapshot.

use serde::{Deserialize, Serialize};

use crate::model::{
    ApplicationState, Balance, Category, HistoryEntry, Mark, MarkStatus, RateMeta, Sheet,
    Template, ViewMode,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Action {
    /// Create a sheet and make it active, optionally seeded from a template.
    #[serde(rename_all = "camelCase")]
    CreateSheet {
        id: String,
        name: String,
        month: Option<String>,
        created_at: i64,
        template_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    RenameSheet { sheet_id: String, name: String },
    #[serde(rename_all = "camelCase")]
    SelectSheet { sheet_id: String },
    /// Move a sheet into history.
    #[serde(rename_all = "camelCase")]
    ArchiveSheet {
        sheet_id: String,
        entry_id: String,
        archived_at: i64,
    },
    #[serde(rename_all = "camelCase")]
    UpsertCategory { sheet_id: String, category: Category },
    #[serde(rename_all = "camelCase")]
    SetCategoryAmount {
        sheet_id: String,
        category_id: String,
        amount: f64,
    },
    /// Remove a category and unlink marks that pointed at it.
    #[serde(rename_all = "camelCase")]
    RemoveCategory { sheet_id: String, category_id: String },
    #[serde(rename_all = "camelCase")]
    AddMark { sheet_id: String, mark: Mark },
    #[serde(rename_all = "camelCase")]
    SetMarkStatus {
        sheet_id: String,
        mark_id: String,
        status: MarkStatus,
    },
    #[serde(rename_all = "camelCase")]
    RemoveMark { sheet_id: String, mark_id: String },
    #[serde(rename_all = "camelCase")]
    UpsertBalance { sheet_id: String, balance: Balance },
    #[serde(rename_all = "camelCase")]
    RemoveBalance { sheet_id: String, balance_id: String },
    /// Save a sheet's categories as a reusable template.
    #[serde(rename_all = "camelCase")]
    SaveTemplate {
        sheet_id: String,
        template_id: String,
        name: String,
    },
    SetViewMode { mode: ViewMode },
    SetNotes { notes: String },
    SetExchangeRate { rate: f64, meta: Option<RateMeta> },
    /// Replace the whole state (import).
    ReplaceState { state: Box<ApplicationState> },
}

/// Apply `action` to `state`, producing a new snapshot.
pub fn reduce(state: &ApplicationState, action: Action) -> ApplicationState {
    let mut next = state.clone();
    match action {
        Action::CreateSheet {
            id,
            name,
            month,
            created_at,
            template_id,
        } => {
            if next.sheet(&id).is_some() {
                return next;
            }
            let categories: Vec<Category> = template_id
                .and_then(|tid| next.templates.iter().find(|t| t.id == tid))
                .map(|template| {
                    template
                        .categories
                        .iter()
                        .map(|c| Category {
                            id: format!("{id}:{}", c.id),
                            ..c.clone()
                        })
                        .collect()
                })
                .unwrap_or_default();
            next.sheets.push(Sheet {
                id: id.clone(),
                name,
                month,
                created_at,
                categories,
                marks: Vec::new(),
                balances: Vec::new(),
            });
            next.active_sheet_id = Some(id);
        }
        Action::RenameSheet { sheet_id, name } => {
            if let Some(sheet) = sheet_mut(&mut next, &sheet_id) {
                sheet.name = name;
            }
        }
        Action::SelectSheet { sheet_id } => {
            if next.sheet(&sheet_id).is_some() {
                next.active_sheet_id = Some(sheet_id);
            }
        }
        Action::ArchiveSheet {
            sheet_id,
            entry_id,
            archived_at,
        } => {
            if let Some(pos) = next.sheets.iter().position(|s| s.id == sheet_id) {
                let sheet = next.sheets.remove(pos);
                next.history.push(HistoryEntry {
                    id: entry_id,
                    archived_at,
                    sheet,
                });
                if next.active_sheet_id.as_deref() == Some(sheet_id.as_str()) {
                    next.active_sheet_id = next.sheets.first().map(|s| s.id.clone());
                }
            }
        }
        Action::UpsertCategory { sheet_id, category } => {
            if !category.amount.is_finite() {
                return next;
            }
            if let Some(sheet) = sheet_mut(&mut next, &sheet_id) {
                upsert(&mut sheet.categories, category, |c| &c.id);
            }
        }
        Action::SetCategoryAmount {
            sheet_id,
            category_id,
            amount,
        } => {
            if !amount.is_finite() {
                return next;
            }
            if let Some(category) = sheet_mut(&mut next, &sheet_id)
                .and_then(|s| s.categories.iter_mut().find(|c| c.id == category_id))
            {
                category.amount = amount;
            }
        }
        Action::RemoveCategory {
            sheet_id,
            category_id,
        } => {
            if let Some(sheet) = sheet_mut(&mut next, &sheet_id) {
                sheet.categories.retain(|c| c.id != category_id);
                for mark in &mut sheet.marks {
                    if mark.category_id.as_deref() == Some(category_id.as_str()) {
                        mark.category_id = None;
                    }
                }
            }
        }
        Action::AddMark { sheet_id, mark } => {
            if !mark.amount.is_finite() {
                return next;
            }
            if let Some(sheet) = sheet_mut(&mut next, &sheet_id) {
                if !sheet.marks.iter().any(|m| m.id == mark.id) {
                    sheet.marks.push(mark);
                }
            }
        }
        Action::SetMarkStatus {
            sheet_id,
            mark_id,
            status,
        } => {
            if let Some(mark) = sheet_mut(&mut next, &sheet_id)
                .and_then(|s| s.marks.iter_mut().find(|m| m.id == mark_id))
            {
                mark.status = status;
            }
        }
        Action::RemoveMark { sheet_id, mark_id } => {
            if let Some(sheet) = sheet_mut(&mut next, &sheet_id) {
                sheet.marks.retain(|m| m.id != mark_id);
            }
        }
        Action::UpsertBalance { sheet_id, balance } => {
            if !balance.amount.is_finite() {
                return next;
            }
            if let Some(sheet) = sheet_mut(&mut next, &sheet_id) {
                upsert(&mut sheet.balances, balance, |b| &b.id);
            }
        }
        Action::RemoveBalance {
            sheet_id,
            balance_id,
        } => {
            if let Some(sheet) = sheet_mut(&mut next, &sheet_id) {
                sheet.balances.retain(|b| b.id != balance_id);
                for mark in &mut sheet.marks {
                    if mark.balance_id.as_deref() == Some(balance_id.as_str()) {
                        mark.balance_id = None;
                    }
                }
            }
        }
        Action::SaveTemplate {
            sheet_id,
            template_id,
            name,
        } => {
            if let Some(categories) = next.sheet(&sheet_id).map(|s| s.categories.clone()) {
                upsert(
                    &mut next.templates,
                    Template {
                        id: template_id,
                        name,
                        categories,
                    },
                    |t| &t.id,
                );
            }
        }
        Action::SetViewMode { mode } => next.view_mode = mode,
        Action::SetNotes { notes } => next.notes = notes,
        Action::SetExchangeRate { rate, meta } => {
            if rate.is_finite() && rate > 0.0 {
                next.exchange_rate = rate;
                next.rate_meta = meta;
            }
        }
        Action::ReplaceState { state } => return *state,
    }
    next
}

fn sheet_mut<'a>(state: &'a mut ApplicationState, sheet_id: &str) -> Option<&'a mut Sheet> {
    state.sheets.iter_mut().find(|s| s.id == sheet_id)
}

/// Replace the item with the same id in place, or append.
fn upsert<T>(items: &mut Vec<T>, item: T, id: impl Fn(&T) -> &String) {
    match items.iter().position(|existing| id(existing) == id(&item)) {
        Some(pos) => items[pos] = item,
        None => items.push(item),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Direction;

    fn create(id: &str) -> Action {
        Action::CreateSheet {
            id: id.into(),
            name: format!("Sheet {id}"),
            month: None,
            created_at: 1,
            template_id: None,
        }
    }

    fn category(id: &str, amount: f64) -> Category {
        Category {
            id: id.into(),
            name: id.to_uppercase(),
            amount,
        }
    }

    fn mark(id: &str, category_id: Option<&str>) -> Mark {
        Mark {
            id: id.into(),
            title: id.into(),
            amount: 10.0,
            direction: Direction::Outgoing,
            status: MarkStatus::Pending,
            category_id: category_id.map(String::from),
            balance_id: None,
            due_date: None,
        }
    }

    fn with_sheet() -> ApplicationState {
        reduce(&ApplicationState::empty(), create("s1"))
    }

    // ==================== sheets ====================

    #[test]
    fn test_create_sheet_becomes_active() {
        let state = with_sheet();
        assert_eq!(state.sheets.len(), 1);
        assert_eq!(state.active_sheet_id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_reduce_does_not_touch_input() {
        let before = ApplicationState::empty();
        let after = reduce(&before, create("s1"));
        assert!(before.sheets.is_empty());
        assert_ne!(before.fingerprint(), after.fingerprint());
    }

    #[test]
    fn test_create_from_template_copies_categories() {
        let state = reduce(
            &with_sheet(),
            Action::UpsertCategory {
                sheet_id: "s1".into(),
                category: category("rent", 900.0),
            },
        );
        let state = reduce(
            &state,
            Action::SaveTemplate {
                sheet_id: "s1".into(),
                template_id: "t1".into(),
                name: "Basics".into(),
            },
        );
        let state = reduce(
            &state,
            Action::CreateSheet {
                id: "s2".into(),
                name: "June".into(),
                month: Some("2024-06".into()),
                created_at: 2,
                template_id: Some("t1".into()),
            },
        );

        let june = state.sheet("s2").unwrap();
        assert_eq!(june.categories.len(), 1);
        assert_eq!(june.categories[0].id, "s2:rent");
        assert_eq!(june.categories[0].amount, 900.0);
    }

    #[test]
    fn test_archive_moves_sheet_to_history() {
        let state = reduce(&with_sheet(), create("s2"));
        let state = reduce(
            &state,
            Action::ArchiveSheet {
                sheet_id: "s2".into(),
                entry_id: "h1".into(),
                archived_at: 99,
            },
        );

        assert_eq!(state.sheets.len(), 1);
        assert_eq!(state.history[0].sheet.id, "s2");
        assert_eq!(state.history[0].archived_at, 99);
        assert_eq!(state.active_sheet_id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_select_unknown_sheet_is_noop() {
        let state = with_sheet();
        let next = reduce(
            &state,
            Action::SelectSheet {
                sheet_id: "missing".into(),
            },
        );
        assert_eq!(state.fingerprint(), next.fingerprint());
    }

    // ==================== categories and marks ====================

    #[test]
    fn test_set_category_amount() {
        let state = reduce(
            &with_sheet(),
            Action::UpsertCategory {
                sheet_id: "s1".into(),
                category: category("food", 100.0),
            },
        );
        let state = reduce(
            &state,
            Action::SetCategoryAmount {
                sheet_id: "s1".into(),
                category_id: "food".into(),
                amount: 250.0,
            },
        );
        assert_eq!(state.sheets[0].categories[0].amount, 250.0);
    }

    #[test]
    fn test_non_finite_amounts_are_ignored() {
        let state = reduce(
            &with_sheet(),
            Action::UpsertCategory {
                sheet_id: "s1".into(),
                category: category("food", 100.0),
            },
        );

        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let actions = [
                Action::SetCategoryAmount {
                    sheet_id: "s1".into(),
                    category_id: "food".into(),
                    amount: bad,
                },
                Action::UpsertCategory {
                    sheet_id: "s1".into(),
                    category: category("rent", bad),
                },
                Action::AddMark {
                    sheet_id: "s1".into(),
                    mark: Mark {
                        amount: bad,
                        ..mark("m1", None)
                    },
                },
                Action::UpsertBalance {
                    sheet_id: "s1".into(),
                    balance: Balance {
                        id: "b1".into(),
                        name: "Checking".into(),
                        amount: bad,
                        currency: "EUR".into(),
                    },
                },
            ];
            for action in actions {
                let next = reduce(&state, action);
                assert_eq!(next.fingerprint(), state.fingerprint());
            }
        }

        // Stored state still reads back
        let json = serde_json::to_string(&state).unwrap();
        let back: ApplicationState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_remove_category_unlinks_marks() {
        let mut state = with_sheet();
        for action in [
            Action::UpsertCategory {
                sheet_id: "s1".into(),
                category: category("food", 100.0),
            },
            Action::AddMark {
                sheet_id: "s1".into(),
                mark: mark("m1", Some("food")),
            },
            Action::RemoveCategory {
                sheet_id: "s1".into(),
                category_id: "food".into(),
            },
        ] {
            state = reduce(&state, action);
        }

        assert!(state.sheets[0].categories.is_empty());
        assert_eq!(state.sheets[0].marks[0].category_id, None);
    }

    #[test]
    fn test_mark_lifecycle() {
        let state = reduce(
            &with_sheet(),
            Action::AddMark {
                sheet_id: "s1".into(),
                mark: mark("m1", None),
            },
        );
        let state = reduce(
            &state,
            Action::SetMarkStatus {
                sheet_id: "s1".into(),
                mark_id: "m1".into(),
                status: MarkStatus::Completed,
            },
        );
        assert_eq!(state.sheets[0].marks[0].status, MarkStatus::Completed);

        let state = reduce(
            &state,
            Action::RemoveMark {
                sheet_id: "s1".into(),
                mark_id: "m1".into(),
            },
        );
        assert!(state.sheets[0].marks.is_empty());
    }

    // ==================== top-level fields ====================

    #[test]
    fn test_exchange_rate_rejects_nonsense() {
        let state = reduce(
            &ApplicationState::empty(),
            Action::SetExchangeRate {
                rate: -1.0,
                meta: None,
            },
        );
        assert_eq!(state.exchange_rate, 1.0);

        let state = reduce(
            &state,
            Action::SetExchangeRate {
                rate: 0.92,
                meta: Some(RateMeta {
                    source: "manual".into(),
                    fetched_at: 5,
                }),
            },
        );
        assert_eq!(state.exchange_rate, 0.92);
        assert_eq!(state.rate_meta.unwrap().source, "manual");
    }

    #[test]
    fn test_replace_state() {
        let mut imported = ApplicationState::empty();
        imported.notes = "imported".into();
        let state = reduce(
            &with_sheet(),
            Action::ReplaceState {
                state: Box::new(imported.clone()),
            },
        );
        assert_eq!(state, imported);
    }

    #[test]
    fn test_action_json_shape() {
        let json = serde_json::to_string(&Action::SetCategoryAmount {
            sheet_id: "s1".into(),
            category_id: "c1".into(),
            amount: 5.0,
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"type":"setCategoryAmount","sheetId":"s1","categoryId":"c1","amount":5.0}"#
        );
    }
}
