//! Command-line subcommands and their translation into reducer actions.
//!
//! Sheets, categories, marks and balances can be referred to by id or by
//! name (case-insensitive). Sheet-scoped commands default to the active sheet.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Subcommand, ValueEnum};
use std::fmt::Write as _;
use std::path::PathBuf;
use tally_core::model::{
    Balance, Category, Direction, Mark, MarkStatus, RateMeta, Sheet, ViewMode,
};
use tally_core::{Action, ApplicationState, SyncStatus};
use uuid::Uuid;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Show the active sheet and sync status
    Show,
    /// Manage sheets
    #[command(subcommand)]
    Sheet(SheetCommand),
    /// Manage budget categories on a sheet
    #[command(subcommand)]
    Category(CategoryCommand),
    /// Manage planned transactions on a sheet
    #[command(subcommand)]
    Mark(MarkCommand),
    /// Manage account balances on a sheet
    #[command(subcommand)]
    Balance(BalanceCommand),
    /// Manage category templates
    #[command(subcommand)]
    Template(TemplateCommand),
    /// Replace the free-form notes
    Notes { text: String },
    /// Set the exchange rate used for conversions
    Rate {
        rate: f64,
        /// Where the rate came from
        #[arg(long)]
        source: Option<String>,
    },
    /// Switch the default view
    View {
        #[arg(value_enum)]
        mode: ViewArg,
    },
    /// Replace all data with an exported JSON file
    Import { path: PathBuf },
    /// Write all data as JSON (stdout if no file is given)
    Export {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Stay connected and print sync events until Ctrl+C
    Watch,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum SheetCommand {
    /// Create a sheet and make it active
    Create {
        name: String,
        /// Month label, e.g. 2024-05
        #[arg(long)]
        month: Option<String>,
        /// Seed categories from a template
        #[arg(long)]
        template: Option<String>,
    },
    Rename {
        name: String,
        #[arg(long)]
        sheet: Option<String>,
    },
    /// Make a sheet active
    Select { sheet: String },
    /// Move a sheet into history
    Archive {
        #[arg(long)]
        sheet: Option<String>,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CategoryCommand {
    /// Create a category or change its amount
    Set {
        name: String,
        amount: f64,
        #[arg(long)]
        sheet: Option<String>,
    },
    Remove {
        category: String,
        #[arg(long)]
        sheet: Option<String>,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum MarkCommand {
    Add {
        title: String,
        amount: f64,
        /// Money coming in (default is going out)
        #[arg(long)]
        incoming: bool,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        balance: Option<String>,
        /// Due date, e.g. 2024-05-15
        #[arg(long)]
        due: Option<String>,
        #[arg(long)]
        sheet: Option<String>,
    },
    Complete {
        mark: String,
        #[arg(long)]
        sheet: Option<String>,
    },
    Reopen {
        mark: String,
        #[arg(long)]
        sheet: Option<String>,
    },
    Remove {
        mark: String,
        #[arg(long)]
        sheet: Option<String>,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum BalanceCommand {
    /// Create a balance or change its amount
    Set {
        name: String,
        amount: f64,
        #[arg(long, default_value = "USD")]
        currency: String,
        #[arg(long)]
        sheet: Option<String>,
    },
    Remove {
        balance: String,
        #[arg(long)]
        sheet: Option<String>,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum TemplateCommand {
    /// Save a sheet's categories as a template
    Save {
        name: String,
        #[arg(long)]
        sheet: Option<String>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewArg {
    Sheet,
    Summary,
}

impl From<ViewArg> for ViewMode {
    fn from(arg: ViewArg) -> Self {
        match arg {
            ViewArg::Sheet => ViewMode::Sheet,
            ViewArg::Summary => ViewMode::Summary,
        }
    }
}

fn finite_amount(amount: f64) -> Result<f64> {
    if !amount.is_finite() {
        bail!("Amount must be a finite number, got {}", amount);
    }
    Ok(amount)
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn matches(id: &str, name: &str, reference: &str) -> bool {
    id == reference || name.eq_ignore_ascii_case(reference)
}

fn find_sheet<'a>(state: &'a ApplicationState, reference: Option<&str>) -> Result<&'a Sheet> {
    match reference {
        Some(reference) => state
            .sheets
            .iter()
            .find(|s| matches(&s.id, &s.name, reference))
            .ok_or_else(|| anyhow!("No sheet named {:?}", reference)),
        None => state
            .active_sheet()
            .context("No active sheet; create one with `tally sheet create`"),
    }
}

fn find_category<'a>(sheet: &'a Sheet, reference: &str) -> Option<&'a Category> {
    sheet
        .categories
        .iter()
        .find(|c| matches(&c.id, &c.name, reference))
}

fn find_mark<'a>(sheet: &'a Sheet, reference: &str) -> Result<&'a Mark> {
    sheet
        .marks
        .iter()
        .find(|m| matches(&m.id, &m.title, reference))
        .ok_or_else(|| anyhow!("No mark {:?} on sheet {:?}", reference, sheet.name))
}

fn find_balance<'a>(sheet: &'a Sheet, reference: &str) -> Option<&'a Balance> {
    sheet
        .balances
        .iter()
        .find(|b| matches(&b.id, &b.name, reference))
}

impl Command {
    /// The action this command performs, or `None` for commands that only read.
    pub fn to_action(&self, state: &ApplicationState, now_ms: i64) -> Result<Option<Action>> {
        let action = match self {
            Command::Show
            | Command::Import { .. }
            | Command::Export { .. }
            | Command::Watch => return Ok(None),
            Command::Sheet(cmd) => cmd.to_action(state, now_ms)?,
            Command::Category(cmd) => cmd.to_action(state)?,
            Command::Mark(cmd) => cmd.to_action(state)?,
            Command::Balance(cmd) => cmd.to_action(state)?,
            Command::Template(TemplateCommand::Save { name, sheet }) => {
                let sheet = find_sheet(state, sheet.as_deref())?;
                Action::SaveTemplate {
                    sheet_id: sheet.id.clone(),
                    template_id: new_id(),
                    name: name.clone(),
                }
            }
            Command::Notes { text } => Action::SetNotes {
                notes: text.clone(),
            },
            Command::Rate { rate, source } => {
                if !rate.is_finite() || *rate <= 0.0 {
                    bail!("Exchange rate must be a positive number");
                }
                Action::SetExchangeRate {
                    rate: *rate,
                    meta: source.as_ref().map(|source| RateMeta {
                        source: source.clone(),
                        fetched_at: now_ms,
                    }),
                }
            }
            Command::View { mode } => Action::SetViewMode {
                mode: (*mode).into(),
            },
        };
        Ok(Some(action))
    }
}

impl SheetCommand {
    fn to_action(&self, state: &ApplicationState, now_ms: i64) -> Result<Action> {
        Ok(match self {
            SheetCommand::Create {
                name,
                month,
                template,
            } => {
                let template_id = match template {
                    Some(reference) => Some(
                        state
                            .templates
                            .iter()
                            .find(|t| matches(&t.id, &t.name, reference))
                            .map(|t| t.id.clone())
                            .ok_or_else(|| anyhow!("No template named {:?}", reference))?,
                    ),
                    None => None,
                };
                Action::CreateSheet {
                    id: new_id(),
                    name: name.clone(),
                    month: month.clone(),
                    created_at: now_ms,
                    template_id,
                }
            }
            SheetCommand::Rename { name, sheet } => Action::RenameSheet {
                sheet_id: find_sheet(state, sheet.as_deref())?.id.clone(),
                name: name.clone(),
            },
            SheetCommand::Select { sheet } => Action::SelectSheet {
                sheet_id: find_sheet(state, Some(sheet))?.id.clone(),
            },
            SheetCommand::Archive { sheet } => Action::ArchiveSheet {
                sheet_id: find_sheet(state, sheet.as_deref())?.id.clone(),
                entry_id: new_id(),
                archived_at: now_ms,
            },
        })
    }
}

impl CategoryCommand {
    fn to_action(&self, state: &ApplicationState) -> Result<Action> {
        Ok(match self {
            CategoryCommand::Set {
                name,
                amount,
                sheet,
            } => {
                let amount = finite_amount(*amount)?;
                let sheet = find_sheet(state, sheet.as_deref())?;
                match find_category(sheet, name) {
                    Some(category) => Action::SetCategoryAmount {
                        sheet_id: sheet.id.clone(),
                        category_id: category.id.clone(),
                        amount,
                    },
                    None => Action::UpsertCategory {
                        sheet_id: sheet.id.clone(),
                        category: Category {
                            id: new_id(),
                            name: name.clone(),
                            amount,
                        },
                    },
                }
            }
            CategoryCommand::Remove { category, sheet } => {
                let sheet = find_sheet(state, sheet.as_deref())?;
                let category = find_category(sheet, category)
                    .ok_or_else(|| anyhow!("No category {:?} on sheet {:?}", category, sheet.name))?;
                Action::RemoveCategory {
                    sheet_id: sheet.id.clone(),
                    category_id: category.id.clone(),
                }
            }
        })
    }
}

impl MarkCommand {
    fn to_action(&self, state: &ApplicationState) -> Result<Action> {
        Ok(match self {
            MarkCommand::Add {
                title,
                amount,
                incoming,
                category,
                balance,
                due,
                sheet,
            } => {
                let amount = finite_amount(*amount)?;
                let sheet = find_sheet(state, sheet.as_deref())?;
                let category_id = match category {
                    Some(reference) => Some(
                        find_category(sheet, reference)
                            .ok_or_else(|| anyhow!("No category {:?}", reference))?
                            .id
                            .clone(),
                    ),
                    None => None,
                };
                let balance_id = match balance {
                    Some(reference) => Some(
                        find_balance(sheet, reference)
                            .ok_or_else(|| anyhow!("No balance {:?}", reference))?
                            .id
                            .clone(),
                    ),
                    None => None,
                };
                Action::AddMark {
                    sheet_id: sheet.id.clone(),
                    mark: Mark {
                        id: new_id(),
                        title: title.clone(),
                        amount: amount.abs(),
                        direction: if *incoming {
                            Direction::Incoming
                        } else {
                            Direction::Outgoing
                        },
                        status: MarkStatus::Pending,
                        category_id,
                        balance_id,
                        due_date: due.clone(),
                    },
                }
            }
            MarkCommand::Complete { mark, sheet } | MarkCommand::Reopen { mark, sheet } => {
                let sheet = find_sheet(state, sheet.as_deref())?;
                let status = if matches!(self, MarkCommand::Complete { .. }) {
                    MarkStatus::Completed
                } else {
                    MarkStatus::Pending
                };
                Action::SetMarkStatus {
                    sheet_id: sheet.id.clone(),
                    mark_id: find_mark(sheet, mark)?.id.clone(),
                    status,
                }
            }
            MarkCommand::Remove { mark, sheet } => {
                let sheet = find_sheet(state, sheet.as_deref())?;
                Action::RemoveMark {
                    sheet_id: sheet.id.clone(),
                    mark_id: find_mark(sheet, mark)?.id.clone(),
                }
            }
        })
    }
}

impl BalanceCommand {
    fn to_action(&self, state: &ApplicationState) -> Result<Action> {
        Ok(match self {
            BalanceCommand::Set {
                name,
                amount,
                currency,
                sheet,
            } => {
                let amount = finite_amount(*amount)?;
                let sheet = find_sheet(state, sheet.as_deref())?;
                let id = find_balance(sheet, name)
                    .map(|b| b.id.clone())
                    .unwrap_or_else(new_id);
                Action::UpsertBalance {
                    sheet_id: sheet.id.clone(),
                    balance: Balance {
                        id,
                        name: name.clone(),
                        amount,
                        currency: currency.clone(),
                    },
                }
            }
            BalanceCommand::Remove { balance, sheet } => {
                let sheet = find_sheet(state, sheet.as_deref())?;
                let balance = find_balance(sheet, balance)
                    .ok_or_else(|| anyhow!("No balance {:?} on sheet {:?}", balance, sheet.name))?;
                Action::RemoveBalance {
                    sheet_id: sheet.id.clone(),
                    balance_id: balance.id.clone(),
                }
            }
        })
    }
}

/// Human-readable summary of the active sheet.
pub fn render(state: &ApplicationState, status: &SyncStatus) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", render_status(status));

    match state.active_sheet() {
        None => {
            let _ = writeln!(out, "No sheets yet.");
        }
        Some(sheet) => {
            let month = sheet.month.as_deref().map(|m| format!(" ({m})")).unwrap_or_default();
            let _ = writeln!(out, "\n{}{}", sheet.name, month);

            if !sheet.categories.is_empty() {
                let _ = writeln!(out, "\nCategories:");
                for category in &sheet.categories {
                    let _ = writeln!(out, "  {:<24} {:>10.2}", category.name, category.amount);
                }
            }
            if !sheet.marks.is_empty() {
                let _ = writeln!(out, "\nMarks:");
                for mark in &sheet.marks {
                    let done = match mark.status {
                        MarkStatus::Completed => "x",
                        MarkStatus::Pending => " ",
                    };
                    let _ = writeln!(
                        out,
                        "  [{}] {:<20} {:>10.2}",
                        done,
                        mark.title,
                        mark.signed_amount()
                    );
                }
            }
            if !sheet.balances.is_empty() {
                let _ = writeln!(out, "\nBalances:");
                for balance in &sheet.balances {
                    let _ = writeln!(
                        out,
                        "  {:<20} {:>10.2} {}",
                        balance.name, balance.amount, balance.currency
                    );
                }
            }
            let _ = writeln!(
                out,
                "\nBudgeted {:.2}, settled {:.2}, outstanding {:.2}",
                sheet.budgeted(),
                sheet.settled(),
                sheet.outstanding()
            );
        }
    }

    let others = state.sheets.len().saturating_sub(1);
    if others > 0 || !state.history.is_empty() {
        let _ = writeln!(
            out,
            "{} other sheet(s), {} archived",
            others,
            state.history.len()
        );
    }
    if !state.notes.is_empty() {
        let _ = writeln!(out, "\nNotes: {}", state.notes);
    }
    out
}

pub fn render_status(status: &SyncStatus) -> String {
    let who = status
        .identity
        .as_ref()
        .map(|id| format!("signed in as {id}"))
        .unwrap_or_else(|| "signed out".to_string());
    let sync = if status.unsaved {
        match &status.last_error {
            Some(err) => format!("unsynced changes ({err})"),
            None => "unsynced changes".to_string(),
        }
    } else {
        "in sync".to_string()
    };
    format!("[{who}, {sync}]")
}
