//! Per-layer phase state machine.

use anyhow::Result;
use std::fmt;

/// Build phases of one layer, in the only order they may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    PreBuild,
    Build,
    PostBuild,
    Output,
    Done,
}

impl Phase {
    /// The phase that must follow this one.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::PreBuild => Some(Phase::Build),
            Phase::Build => Some(Phase::PostBuild),
            Phase::PostBuild => Some(Phase::Output),
            Phase::Output => Some(Phase::Done),
            Phase::Done => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::PreBuild => write!(f, "PRE_BUILD"),
            Phase::Build => write!(f, "BUILD"),
            Phase::PostBuild => write!(f, "POST_BUILD"),
            Phase::Output => write!(f, "OUTPUT"),
            Phase::Done => write!(f, "DONE"),
        }
    }
}

/// Tracks where one layer is and refuses out-of-order moves.
#[derive(Debug)]
pub struct PhaseTracker {
    layer: String,
    current: Option<Phase>,
    skippable: bool,
}

impl PhaseTracker {
    /// `skippable` allows `POST_BUILD -> DONE` (intermediate layer without output).
    pub fn new(layer: impl Into<String>, skippable: bool) -> Self {
        Self {
            layer: layer.into(),
            current: None,
            skippable,
        }
    }

    pub fn current(&self) -> Option<Phase> {
        self.current
    }

    pub fn enter(&mut self, phase: Phase) -> Result<()> {
        let allowed = match self.current {
            None => phase == Phase::PreBuild,
            Some(Phase::PostBuild) if phase == Phase::Done => self.skippable,
            Some(current) => current.next() == Some(phase),
        };
        if !allowed {
            anyhow::bail!(
                "Layer '{}' cannot enter {} from {}",
                self.layer,
                phase,
                self.current
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "start".to_string())
            );
        }
        tracing::info!("[{}] {}", self.layer, phase);
        self.current = Some(phase);
        Ok(())
    }
}
