//! Executes a single stage against a run's state.
//!
//! The runner resolves a stage's input keys, hands them to the stage's
//! logic together with the current window, and commits the result. Compactor
//! stages go through the [`CompactionGate`] so the raw artifact is replaced
//! rather than kept alongside its summary.
//!
//! Every invocation is bracketed by `stage_start` / `stage_end` events. The
//! runner never retries; a failed invocation comes back as a
//! [`StageFailure`] and the controller decides what happens next.

use super::stage::{StageDescriptor, StageKind, StageLogic, StageRequest};
use crate::TurnRole;
use crate::context::gate::CompactionGate;
use crate::context::meter::SizeMeter;
use crate::context::window::SlidingWindow;
use crate::error::{StageFailure, StageLogicError};
use crate::events::{EventRecorder, PipelineEvent};
use crate::state::store::StateStore;
use std::time::Instant;
use tracing::warn;

/// Borrows the pieces of one run needed to execute a stage.
pub struct StageRunner<'a> {
    store: &'a mut StateStore,
    window: &'a mut SlidingWindow,
    recorder: &'a mut EventRecorder,
    meter: &'a dyn SizeMeter,
}

impl<'a> StageRunner<'a> {
    pub fn new(
        store: &'a mut StateStore,
        window: &'a mut SlidingWindow,
        recorder: &'a mut EventRecorder,
        meter: &'a dyn SizeMeter,
    ) -> Self {
        Self {
            store,
            window,
            recorder,
            meter,
        }
    }

    /// Execute `stage` (at position `index` in its pipeline) with `logic`.
    ///
    /// Returns the text written to the stage's output key.
    pub async fn run(
        &mut self,
        index: usize,
        stage: &StageDescriptor,
        logic: &dyn StageLogic,
    ) -> Result<String, StageFailure> {
        let run_elapsed = self.recorder.elapsed();
        self.recorder.emit(&PipelineEvent::StageStart {
            stage: &stage.name,
            index,
            kind: stage.kind,
            run_elapsed,
        });
        self.store.set_stage(Some(index));
        let started = Instant::now();

        let result = self.invoke(stage, logic).await;

        self.store.set_stage(None);
        self.recorder.emit(&PipelineEvent::StageEnd {
            stage: &stage.name,
            index,
            elapsed: started.elapsed(),
            ok: result.is_ok(),
        });

        let output = result.map_err(|cause| StageFailure::new(&stage.name, cause))?;
        if stage.kind != StageKind::Producer {
            self.window.push(TurnRole::Agent, output.clone());
        }
        Ok(output)
    }

    async fn invoke(
        &mut self,
        stage: &StageDescriptor,
        logic: &dyn StageLogic,
    ) -> Result<String, StageLogicError> {
        let window = self.window.get();

        if stage.kind == StageKind::Compactor {
            let raw_key = stage.input_keys.first().map_or("", String::as_str);
            return CompactionGate::new(self.store, self.recorder, self.meter)
                .compact(
                    &stage.name,
                    raw_key,
                    &stage.output_key,
                    stage.max_output_tokens,
                    logic,
                    &window,
                )
                .await;
        }

        let inputs: Vec<String> = stage
            .input_keys
            .iter()
            .map(|key| self.store.read_or_empty(key).to_string())
            .collect();
        let output = logic
            .run(StageRequest {
                stage: &stage.name,
                kind: stage.kind,
                inputs: &inputs,
                window: &window,
                max_output_tokens: stage.max_output_tokens,
            })
            .await?;

        if let Some(cap) = stage.max_output_tokens {
            let tokens = self.meter.measure(&output);
            if tokens > cap {
                warn!("{}: output of {tokens} tokens exceeds cap of {cap}", stage.name);
            }
        }
        self.store.write(stage.output_key.clone(), output.clone());
        Ok(output)
    }
}
