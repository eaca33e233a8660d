#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tally_core::model::Category;
use tally_core::{
    Action, ApplicationState, Clock, MemoryRemote, MemoryStore, RemoteStore, SyncConfig,
    SyncEvent, SyncHandle, SyncService, UserId,
};
use tokio::time::Instant;

/// 2023-11-14T22:13:20Z
pub const BASE_MS: i64 = 1_700_000_000_000;

/// Wall clock that follows tokio's (pausable) time, offset from `BASE_MS`.
pub struct TokioClock {
    start: Instant,
    offset_ms: i64,
}

impl TokioClock {
    pub fn new(offset_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            start: Instant::now(),
            offset_ms,
        })
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> i64 {
        BASE_MS + self.offset_ms + self.start.elapsed().as_millis() as i64
    }
}

pub fn alice() -> UserId {
    UserId::new("alice").unwrap()
}

pub struct Tab {
    pub handle: SyncHandle,
    pub kv: Arc<MemoryStore>,
    pub events: Arc<Mutex<Vec<SyncEvent>>>,
    _subscription: tally_core::Subscription,
}

impl Tab {
    pub fn open(
        kv: Arc<MemoryStore>,
        remote: &Arc<MemoryRemote>,
        clock: Arc<dyn Clock>,
        identity: Option<UserId>,
    ) -> Self {
        let remote: Arc<dyn RemoteStore> = remote.clone();
        let handle = SyncService::spawn(
            SyncConfig::default(),
            Arc::clone(&kv),
            clock,
            Some(remote),
            identity,
        );
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let subscription = handle
            .events()
            .subscribe(move |event| sink.lock().unwrap().push(event));
        Self {
            handle,
            kv,
            events,
            _subscription: subscription,
        }
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, f: impl Fn(&SyncEvent) -> bool) -> usize {
        self.events().iter().filter(|e| f(e)).count()
    }

    pub async fn dispatch(&self, action: Action) {
        self.handle.dispatch(action).await.unwrap();
    }

    pub async fn settle(&self) {
        self.handle.wait_idle().await.unwrap();
        // let pushes triggered by the last write drain
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Wait out the warm-up window after subscribing.
pub async fn past_warmup() {
    tokio::time::sleep(Duration::from_millis(1_100)).await;
}

pub fn notes(text: &str) -> Action {
    Action::SetNotes {
        notes: text.to_string(),
    }
}

pub fn create_sheet(id: &str, name: &str) -> Action {
    Action::CreateSheet {
        id: id.to_string(),
        name: name.to_string(),
        month: None,
        created_at: BASE_MS,
        template_id: None,
    }
}

pub fn add_category(sheet_id: &str, id: &str, amount: f64) -> Action {
    Action::UpsertCategory {
        sheet_id: sheet_id.to_string(),
        category: Category {
            id: id.to_string(),
            name: id.to_string(),
            amount,
        },
    }
}

pub fn set_amount(sheet_id: &str, id: &str, amount: f64) -> Action {
    Action::SetCategoryAmount {
        sheet_id: sheet_id.to_string(),
        category_id: id.to_string(),
        amount,
    }
}

pub fn state_with_notes(text: &str) -> ApplicationState {
    ApplicationState {
        notes: text.to_string(),
        ..ApplicationState::empty()
    }
}
