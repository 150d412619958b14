//! The ordered step sequence and its editing operations.
//!
//! Step position is the identity `Goto` targets refer to, so every structural
//! edit re-derives all targets in one pass. Dangling targets collapse to
//! `Stop` rather than pointing somewhere arbitrary.

use serde::{Deserialize, Serialize};

use super::step::{FlowAction, LogicalStep, Step, StepPayload};
use crate::error::EngineError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Flowchart {
    steps: Vec<Step>,
}

impl Flowchart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_steps(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Step> {
        self.steps.get_mut(index)
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn steps_mut(&mut self) -> &mut [Step] {
        &mut self.steps
    }

    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    /// Check the graph is runnable: non-empty, the start index in range, and
    /// every `Goto` target within `1..=len`.
    pub fn validate(&self, start_index: usize) -> Result<(), EngineError> {
        if self.steps.is_empty() {
            return Err(EngineError::EmptyFlowchart);
        }
        if start_index >= self.steps.len() {
            return Err(EngineError::InvalidStartStep {
                index: start_index + 1,
                len: self.steps.len(),
            });
        }
        for (i, step) in self.steps.iter().enumerate() {
            for action in step.flow_actions() {
                if let Some(target) = action.goto_target()
                    && (target == 0 || target > self.steps.len())
                {
                    return Err(EngineError::InvalidGotoTarget {
                        step: i + 1,
                        target,
                        len: self.steps.len(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Remove one step, shifting later `Goto` targets down and collapsing
    /// references to the removed step to `Stop`.
    pub fn remove(&mut self, index: usize) -> Step {
        let removed = self.steps.remove(index);
        let removed_target = index + 1;
        for step in &mut self.steps {
            for action in step.flow_actions_mut() {
                if let FlowAction::Goto(target) = *action {
                    if target == removed_target {
                        *action = FlowAction::Stop;
                    } else if target > removed_target {
                        *action = FlowAction::Goto(target - 1);
                    }
                }
            }
        }
        removed
    }

    /// Remove several steps at once. Surviving targets are re-derived from an
    /// old-index → new-index map; targets into the removed set collapse to
    /// `Stop`.
    pub fn remove_many(&mut self, indices: &[usize]) {
        let mut to_remove: Vec<usize> = indices.to_vec();
        to_remove.sort_unstable();
        to_remove.dedup();

        let mut index_map: Vec<Option<usize>> = Vec::with_capacity(self.steps.len());
        let mut next = 0usize;
        for i in 0..self.steps.len() {
            if to_remove.binary_search(&i).is_ok() {
                index_map.push(None);
            } else {
                index_map.push(Some(next));
                next += 1;
            }
        }

        for &i in to_remove.iter().rev() {
            self.steps.remove(i);
        }

        for step in &mut self.steps {
            for action in step.flow_actions_mut() {
                if let FlowAction::Goto(target) = *action {
                    *action = match index_map.get(target - 1).copied().flatten() {
                        Some(new_index) => FlowAction::Goto(new_index + 1),
                        None => FlowAction::Stop,
                    };
                }
            }
        }
    }

    /// Append copies of the given steps. `Goto` targets inside the duplicated
    /// set are remapped onto the copies. Branches leaving the set, including
    /// a trailing `Next` whose successor was not duplicated, collapse to
    /// `Stop` so a copy never jumps back into the originals.
    ///
    /// Returns the indices of the appended copies.
    pub fn duplicate(&mut self, indices: &[usize]) -> Vec<usize> {
        let mut originals: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|&i| i < self.steps.len())
            .collect();
        originals.sort_unstable();
        originals.dedup();
        if originals.is_empty() {
            return Vec::new();
        }

        let base = self.steps.len();
        let mut old_to_new: std::collections::HashMap<usize, usize> =
            std::collections::HashMap::new();
        for (offset, &original) in originals.iter().enumerate() {
            old_to_new.insert(original, base + offset);
        }

        let mut copies: Vec<Step> = Vec::with_capacity(originals.len());
        for &original in &originals {
            let mut copy = self.steps[original].clone();
            copy.name.push_str(" (Copy)");
            copy.state = Default::default();

            for action in copy.flow_actions_mut() {
                match *action {
                    FlowAction::Goto(target) => {
                        *action = match old_to_new.get(&(target - 1)) {
                            Some(&new_index) => FlowAction::Goto(new_index + 1),
                            None => FlowAction::Stop,
                        };
                    }
                    FlowAction::Next => {
                        if !old_to_new.contains_key(&(original + 1)) {
                            *action = FlowAction::Stop;
                        }
                    }
                    FlowAction::Stop => {}
                }
            }
            copies.push(copy);
        }

        self.steps.extend(copies);
        (base..self.steps.len()).collect()
    }

    /// Editor-facing reset of a Count step's counter. Returns whether the
    /// index named a Count step.
    pub fn reset_counter(&mut self, index: usize) -> bool {
        match self.steps.get_mut(index) {
            Some(step)
                if matches!(
                    step.payload,
                    StepPayload::Logical(LogicalStep::Count(_))
                ) =>
            {
                step.state.counter_value = 0;
                true
            }
            _ => false,
        }
    }

    /// Editor-facing reset of a Wait step's timer.
    pub fn reset_wait_timer(&mut self, index: usize) -> bool {
        match self.steps.get_mut(index) {
            Some(step)
                if matches!(step.payload, StepPayload::Logical(LogicalStep::Wait(_))) =>
            {
                step.state.wait_started = None;
                step.state.last_wait_secs = None;
                true
            }
            _ => false,
        }
    }
}
