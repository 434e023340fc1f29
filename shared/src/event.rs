use crate::model::{
    AppStateRecord, ItemId, ProblemSolution, ProcessingStatus, SolutionSet, UploadedItem,
};

/// Every mutation the state container understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    // Items
    ItemsIngested {
        items: Vec<UploadedItem>,
    },
    StatusChanged {
        id: ItemId,
        status: ProcessingStatus,
    },
    StreamingTextChanged {
        id: ItemId,
        text: Option<String>,
    },
    ItemRemoved {
        id: ItemId,
    },

    // Solutions
    SolutionStored {
        solution: SolutionSet,
    },
    ProblemAppended {
        item_id: ItemId,
        problem: ProblemSolution,
    },
    ProblemReplaced {
        item_id: ItemId,
        index: usize,
        problem: ProblemSolution,
    },

    // Selection
    ItemSelected {
        id: Option<ItemId>,
    },
    ProblemSelected {
        index: i64,
    },

    // Bulk
    HandlesReleased,
    Reset,
    Loaded {
        items: Vec<UploadedItem>,
        solutions: Vec<SolutionSet>,
        app_state: Option<AppStateRecord>,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::ItemsIngested { .. } => "items_ingested",
            Event::StatusChanged { .. } => "status_changed",
            Event::StreamingTextChanged { .. } => "streaming_text_changed",
            Event::ItemRemoved { .. } => "item_removed",
            Event::SolutionStored { .. } => "solution_stored",
            Event::ProblemAppended { .. } => "problem_appended",
            Event::ProblemReplaced { .. } => "problem_replaced",
            Event::ItemSelected { .. } => "item_selected",
            Event::ProblemSelected { .. } => "problem_selected",
            Event::HandlesReleased => "handles_released",
            Event::Reset => "reset",
            Event::Loaded { .. } => "loaded",
        }
    }
}
