//! Replay (spec §8's "replaying the event log onto a fresh
//! `ProcessInstance`" round-trip property; named as `replay::fold` by
//! SPEC_FULL §8 since the distilled spec only tests the behavior, not the
//! operation).
//!
//! `process_log` rows carry the state-machine transition each event
//! represents but not the `data` snapshot produced alongside it — only the
//! `process_instance` row's current `data` column does. So `fold` rebuilds
//! `status`, `current_step` and `retries` purely from the log and leaves
//! `data` to the caller-supplied seed, unchanged; it proves the control-flow
//! transitions replay deterministically, not byte-for-byte data fidelity.

use platform_types::{ProcessEvent, ProcessInstance, ProcessLogEntry, ProcessStatus, TERMINAL_STEP};

/// Fold `events` (in `seq` order, starting at `ProcessStarted`) onto `seed`,
/// returning the resulting instance. `seed` supplies the fields no event
/// carries — `process_id`, `process_type`, `business_key`, `data` — and is
/// typically the instance as it stood immediately after `startProcess`.
pub fn fold(seed: &ProcessInstance, events: &[ProcessLogEntry]) -> ProcessInstance {
    let mut instance = seed.clone();

    for entry in events {
        apply(&mut instance, &entry.event);
        instance.updated_at = entry.at;
    }

    instance
}

fn apply(instance: &mut ProcessInstance, event: &ProcessEvent) {
    match event {
        ProcessEvent::ProcessStarted { initial_step } => {
            instance.status = ProcessStatus::Running;
            instance.current_step = initial_step.clone();
            instance.retries = 0;
        }
        ProcessEvent::StepStarted { step, .. } => {
            instance.current_step = step.clone();
        }
        ProcessEvent::StepCompleted { .. } => {
            instance.retries = 0;
        }
        ProcessEvent::StepFailed { retryable, .. } => {
            if *retryable {
                instance.retries += 1;
            }
        }
        ProcessEvent::StepTimedOut { .. } => {}
        ProcessEvent::CompensationTriggered { .. } => {
            instance.status = ProcessStatus::Compensating;
        }
        ProcessEvent::CompensationStarted { .. } | ProcessEvent::CompensationCompleted { .. } => {}
        ProcessEvent::CompensationFailed { .. } => {
            instance.status = ProcessStatus::Failed;
            instance.current_step = TERMINAL_STEP.to_string();
        }
        ProcessEvent::ProcessCompleted => {
            instance.status = ProcessStatus::Succeeded;
            instance.current_step = TERMINAL_STEP.to_string();
        }
        ProcessEvent::ProcessCompensated => {
            instance.status = ProcessStatus::Compensated;
            instance.current_step = TERMINAL_STEP.to_string();
        }
        ProcessEvent::ProcessFailed { .. } => {
            instance.status = ProcessStatus::Failed;
            instance.current_step = TERMINAL_STEP.to_string();
        }
        ProcessEvent::ProcessPaused => {
            instance.status = ProcessStatus::Paused;
        }
        ProcessEvent::ProcessResumed => {
            instance.status = ProcessStatus::Running;
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    fn seed() -> ProcessInstance {
        ProcessInstance {
            process_id: Uuid::new_v4(),
            process_type: "onboard_user".to_string(),
            business_key: "user-1".to_string(),
            status: ProcessStatus::New,
            current_step: "".to_string(),
            data: json!({}),
            retries: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn entry(seq: i64, process_id: Uuid, event: ProcessEvent) -> ProcessLogEntry {
        ProcessLogEntry { process_id, seq, at: Utc::now(), event }
    }

    #[test]
    fn folding_a_happy_path_log_reaches_succeeded() {
        let seed = seed();
        let pid = seed.process_id;
        let cmd = Uuid::new_v4();
        let events = vec![
            entry(1, pid, ProcessEvent::ProcessStarted { initial_step: "create_account".to_string() }),
            entry(2, pid, ProcessEvent::StepStarted { step: "create_account".to_string(), command_id: None }),
            entry(3, pid, ProcessEvent::StepCompleted { step: "create_account".to_string(), command_id: cmd }),
            entry(4, pid, ProcessEvent::ProcessCompleted),
        ];

        let replayed = fold(&seed, &events);
        assert_eq!(replayed.status, ProcessStatus::Succeeded);
        assert_eq!(replayed.current_step, TERMINAL_STEP);
        assert_eq!(replayed.retries, 0);
    }

    #[test]
    fn folding_a_retried_then_compensated_log_counts_attempts_then_unwinds() {
        let seed = seed();
        let pid = seed.process_id;
        let cmd = Uuid::new_v4();
        let events = vec![
            entry(1, pid, ProcessEvent::ProcessStarted { initial_step: "charge_card".to_string() }),
            entry(2, pid, ProcessEvent::StepStarted { step: "charge_card".to_string(), command_id: None }),
            entry(
                3,
                pid,
                ProcessEvent::StepFailed {
                    step: "charge_card".to_string(),
                    command_id: cmd,
                    retryable: true,
                    error: "connection reset".to_string(),
                },
            ),
            entry(4, pid, ProcessEvent::StepStarted { step: "charge_card".to_string(), command_id: None }),
            entry(
                5,
                pid,
                ProcessEvent::StepFailed {
                    step: "charge_card".to_string(),
                    command_id: cmd,
                    retryable: false,
                    error: "card declined".to_string(),
                },
            ),
            entry(6, pid, ProcessEvent::CompensationTriggered { reason: "card declined".to_string() }),
            entry(7, pid, ProcessEvent::ProcessCompensated),
        ];

        let replayed = fold(&seed, &events);
        assert_eq!(replayed.retries, 1);
        assert_eq!(replayed.status, ProcessStatus::Compensated);
        assert_eq!(replayed.current_step, TERMINAL_STEP);
    }

    #[test]
    fn folding_a_pause_then_resume_round_trips_back_to_running() {
        let seed = seed();
        let pid = seed.process_id;
        let events = vec![
            entry(1, pid, ProcessEvent::ProcessStarted { initial_step: "wait_for_review".to_string() }),
            entry(2, pid, ProcessEvent::StepStarted { step: "wait_for_review".to_string(), command_id: None }),
            entry(3, pid, ProcessEvent::ProcessPaused),
            entry(4, pid, ProcessEvent::ProcessResumed),
        ];

        let replayed = fold(&seed, &events);
        assert_eq!(replayed.status, ProcessStatus::Running);
        assert_eq!(replayed.current_step, "wait_for_review");
    }
}
