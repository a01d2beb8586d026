use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::corpus::NoiseCorpus;
use crate::session::{send_with_retry, AssistantSession, SessionResult, SessionUsage, MAX_RETRIES};

/// Knobs the controller needs, lifted out of the full experiment config so
/// tests can construct a controller directly.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub ack_template: String,
    pub batch_size: usize,
    pub max_chunks: usize,
    pub send_timeout: Duration,
    pub task_timeout: Duration,
}

/// Result of the batched-incremental strategy: noise batches sent as session
/// continuations, then the task prompt as one final continuation.
#[derive(Debug, Clone)]
pub struct IncrementalOutcome {
    pub success: bool,
    pub response: String,
    pub error: Option<String>,
    pub session_id: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub noise_calls: usize,
}

/// Converts a target context-fill percentage into concrete actions against
/// the session: incremental injection with measurement feedback, or prompt
/// construction for the single-shot strategy.
pub struct ContextController<S: AssistantSession, C: NoiseCorpus> {
    session: S,
    corpus: C,
    spec_text: String,
    prompt_text: String,
    settings: ControllerSettings,
    sleep: Box<dyn FnMut(Duration)>,
}

impl<S: AssistantSession, C: NoiseCorpus> ContextController<S, C> {
    pub fn new(
        session: S,
        corpus: C,
        spec_text: String,
        prompt_text: String,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            session,
            corpus,
            spec_text,
            prompt_text,
            settings,
            sleep: Box::new(|d| thread::sleep(d)),
        }
    }

    /// Replace the retry backoff sleep. Tests pass a recording closure.
    pub fn with_sleep(mut self, sleep: Box<dyn FnMut(Duration)>) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn reset(&mut self) {
        self.session.reset();
    }

    pub fn fill_percent(&self) -> f64 {
        self.session.fill_percent()
    }

    pub fn usage(&self) -> SessionUsage {
        self.session.usage()
    }

    pub fn has_chunk(&self, id: usize) -> bool {
        self.corpus.exists(id)
    }

    /// Send one noise chunk wrapped in the acknowledgment template so the
    /// backend's reply stays short.
    pub fn inject_chunk(&mut self, id: usize) -> Result<SessionResult> {
        let noise = self.corpus.read(id)?;
        let prompt = self.settings.ack_template.replace("{noise_content}", &noise);
        Ok(self.session.send(&prompt, self.settings.send_timeout))
    }

    /// Incremental strategy: inject chunks until the band minimum is reached.
    /// Stops at the chunk safety bound, on corpus exhaustion, or on overshoot
    /// past the band maximum (overshoot is reported, not corrected).
    pub fn adjust_to_target(&mut self, target_min: f64, target_max: f64) -> (f64, usize) {
        self.reset();
        let mut current = self.fill_percent();
        let mut chunk_id = 0;

        while current < target_min && chunk_id < self.settings.max_chunks {
            if !self.corpus.exists(chunk_id) {
                info!(chunk_id, "noise corpus exhausted");
                break;
            }
            match self.inject_chunk(chunk_id) {
                Ok(result) => {
                    if !result.success {
                        warn!(chunk_id, error = ?result.error, "chunk injection failed");
                    }
                }
                Err(e) => {
                    warn!(chunk_id, error = %e, "chunk read failed");
                    break;
                }
            }
            current = self.fill_percent();
            chunk_id += 1;
            info!(chunk = chunk_id - 1, fill = format!("{:.1}%", current), "context adjusted");

            if current > target_max {
                warn!(
                    fill = format!("{:.1}%", current),
                    max = target_max,
                    "overshoot past target band"
                );
                break;
            }
        }

        (current, chunk_id)
    }

    /// Single-shot strategy: noise chunks and the task in one oversized
    /// prompt. Missing chunks end the noise section early.
    pub fn build_full_prompt(&self, num_chunks: usize) -> Result<String> {
        let noise = self.load_chunks(num_chunks)?.join("\n\n---\n\n");
        Ok(format!(
            "# Reference material\n\n\
             Review the material below, then complete the task at the end.\n\n\
             {}\n\n\
             ---\n\n\
             {}",
            noise,
            self.task_prompt()
        ))
    }

    /// Send the task prompt with retry, as the final step of either strategy.
    pub fn send_task(&mut self, prompt: &str) -> SessionResult {
        send_with_retry(
            &mut self.session,
            prompt,
            self.settings.task_timeout,
            MAX_RETRIES,
            &mut self.sleep,
        )
    }

    /// Batched-incremental strategy for high fill targets: noise in
    /// fixed-size batches, each continuing the session, then the task as one
    /// more continuation send.
    pub fn run_batched(&mut self, num_chunks: usize) -> IncrementalOutcome {
        let chunks = match self.load_chunks(num_chunks) {
            Ok(chunks) => chunks,
            Err(e) => {
                return IncrementalOutcome {
                    success: false,
                    response: String::new(),
                    error: Some(e.to_string()),
                    session_id: None,
                    input_tokens: 0,
                    output_tokens: 0,
                    noise_calls: 0,
                }
            }
        };
        let total = chunks.len();
        let mut input_tokens = 0;
        let mut output_tokens = 0;
        let mut noise_calls = 0;
        let mut session_id = None;

        for (batch_index, batch) in chunks.chunks(self.settings.batch_size).enumerate() {
            let start = batch_index * self.settings.batch_size;
            let prompt = format!(
                "Reference material {}-{} of {}. Review it; reply only with 'Acknowledged'.\n\n{}",
                start + 1,
                start + batch.len(),
                total,
                batch.join("\n\n---\n\n")
            );
            let result = self.session.send(&prompt, self.settings.send_timeout);
            noise_calls += 1;
            input_tokens += result.input_tokens;
            output_tokens += result.output_tokens;
            session_id = result.session_id.clone();
            if !result.success {
                return IncrementalOutcome {
                    success: false,
                    response: String::new(),
                    error: Some(format!(
                        "noise batch {} failed: {}",
                        batch_index + 1,
                        result.error.unwrap_or_else(|| "unknown".to_string())
                    )),
                    session_id,
                    input_tokens,
                    output_tokens,
                    noise_calls,
                };
            }
            info!(batch = batch_index + 1, sent = batch.len(), "noise batch sent");
        }

        let task = self.task_prompt();
        let result = self.send_task(&task);
        input_tokens += result.input_tokens;
        output_tokens += result.output_tokens;
        IncrementalOutcome {
            success: result.success,
            response: result.content,
            error: result.error,
            session_id: result.session_id.or(session_id),
            input_tokens,
            output_tokens,
            noise_calls,
        }
    }

    fn load_chunks(&self, num_chunks: usize) -> Result<Vec<String>> {
        let mut chunks = Vec::new();
        for id in 0..num_chunks {
            if !self.corpus.exists(id) {
                break;
            }
            chunks.push(self.corpus.read(id)?);
        }
        Ok(chunks)
    }

    fn task_prompt(&self) -> String {
        format!(
            "# Implementation task\n\n\
             The task specification follows:\n\n\
             {}\n\n\
             ---\n\n\
             {}\n\n\
             Important:\n\
             - Output only the implementation source code\n\
             - No explanations\n\
             - Wrap the code in a ```python fence\n",
            self.spec_text, self.prompt_text
        )
    }
}

/// Chunks needed to reach a target fill given a calibrated per-chunk rate.
pub fn estimate_chunks_needed(target_percent: f64, chunk_increase_rate: f64) -> usize {
    if chunk_increase_rate <= 0.0 {
        return 0;
    }
    (target_percent / chunk_increase_rate) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{AssistantSession, SessionResult, SessionUsage};
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Session whose fill percentage rises by a fixed step per send.
    struct SteppingSession {
        step_percent: f64,
        capacity: u64,
        usage: SessionUsage,
        prompts: Rc<RefCell<Vec<String>>>,
        fail_on_send: Option<usize>,
        sends: usize,
    }

    impl SteppingSession {
        fn new(step_percent: f64) -> Self {
            Self {
                step_percent,
                capacity: 200_000,
                usage: SessionUsage::default(),
                prompts: Rc::new(RefCell::new(Vec::new())),
                fail_on_send: None,
                sends: 0,
            }
        }
    }

    impl AssistantSession for SteppingSession {
        fn send(&mut self, prompt: &str, _timeout: Duration) -> SessionResult {
            self.sends += 1;
            self.prompts.borrow_mut().push(prompt.to_string());
            if self.fail_on_send == Some(self.sends) {
                return SessionResult {
                    success: false,
                    content: String::new(),
                    input_tokens: 0,
                    output_tokens: 0,
                    session_id: None,
                    error: Some("invalid request".to_string()),
                    duration_ms: 1,
                    usage_estimated: false,
                };
            }
            let tokens = (self.step_percent / 100.0 * self.capacity as f64) as u64;
            self.usage.input_tokens += tokens;
            SessionResult {
                success: true,
                content: "Acknowledged".to_string(),
                input_tokens: tokens,
                output_tokens: 0,
                session_id: Some("s-1".to_string()),
                error: None,
                duration_ms: 1,
                usage_estimated: true,
            }
        }

        fn reset(&mut self) {
            self.usage = SessionUsage::default();
        }

        fn usage(&self) -> SessionUsage {
            self.usage
        }

        fn fill_percent(&self) -> f64 {
            self.usage.fill_percent(self.capacity)
        }
    }

    struct MemCorpus {
        chunks: Vec<String>,
    }

    impl MemCorpus {
        fn of(n: usize) -> Self {
            Self {
                chunks: (0..n).map(|i| format!("noise chunk {}", i)).collect(),
            }
        }
    }

    impl NoiseCorpus for MemCorpus {
        fn exists(&self, id: usize) -> bool {
            id < self.chunks.len()
        }
        fn read(&self, id: usize) -> Result<String> {
            self.chunks
                .get(id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("chunk {} missing", id))
        }
    }

    fn settings() -> ControllerSettings {
        ControllerSettings {
            ack_template: "ACK:\n\n{noise_content}".to_string(),
            batch_size: 20,
            max_chunks: 100,
            send_timeout: Duration::from_secs(1),
            task_timeout: Duration::from_secs(1),
        }
    }

    fn controller(
        session: SteppingSession,
        corpus: MemCorpus,
    ) -> ContextController<SteppingSession, MemCorpus> {
        ContextController::new(
            session,
            corpus,
            "SPEC BODY".to_string(),
            "INSTRUCTIONS".to_string(),
            settings(),
        )
        .with_sleep(Box::new(|_| {}))
    }

    #[test]
    fn adjust_stops_at_band_minimum() {
        let mut ctl = controller(SteppingSession::new(5.0), MemCorpus::of(50));
        let (achieved, chunks) = ctl.adjust_to_target(30.0, 40.0);
        assert_eq!(chunks, 6);
        assert!((achieved - 30.0).abs() < 1e-9);
    }

    #[test]
    fn adjust_reports_overshoot_without_correcting() {
        // 25% per chunk: 25 -> 50 crosses a [30, 40] band's maximum.
        let mut ctl = controller(SteppingSession::new(25.0), MemCorpus::of(50));
        let (achieved, chunks) = ctl.adjust_to_target(30.0, 40.0);
        assert_eq!(chunks, 2);
        assert!(achieved > 40.0);
    }

    #[test]
    fn adjust_stops_on_corpus_exhaustion() {
        let mut ctl = controller(SteppingSession::new(5.0), MemCorpus::of(3));
        let (achieved, chunks) = ctl.adjust_to_target(30.0, 40.0);
        assert_eq!(chunks, 3);
        assert!(achieved < 30.0);
    }

    #[test]
    fn full_prompt_joins_chunks_and_ends_with_task() {
        let ctl = controller(SteppingSession::new(5.0), MemCorpus::of(3));
        let prompt = ctl.build_full_prompt(2).expect("prompt");
        assert!(prompt.contains("noise chunk 0\n\n---\n\nnoise chunk 1"));
        assert!(!prompt.contains("noise chunk 2"));
        assert!(prompt.contains("SPEC BODY"));
        assert!(prompt.contains("INSTRUCTIONS"));
        assert!(prompt.contains("```python"));
    }

    #[test]
    fn batched_sends_ceil_batches_plus_task() {
        let prompts;
        let outcome;
        {
            let session = SteppingSession::new(1.0);
            prompts = Rc::clone(&session.prompts);
            let mut ctl = controller(session, MemCorpus::of(45));
            outcome = ctl.run_batched(45);
        }
        // 45 chunks at batch size 20 -> 3 noise calls, then 1 task call.
        assert!(outcome.success);
        assert_eq!(outcome.noise_calls, 3);
        assert_eq!(prompts.borrow().len(), 4);
        assert!(prompts.borrow()[0].contains("Reference material 1-20 of 45"));
        assert!(prompts.borrow()[2].contains("Reference material 41-45 of 45"));
        assert!(prompts.borrow()[3].contains("SPEC BODY"));
    }

    #[test]
    fn batched_surfaces_batch_failure_with_index() {
        let mut session = SteppingSession::new(1.0);
        session.fail_on_send = Some(2);
        let mut ctl = controller(session, MemCorpus::of(45));
        let outcome = ctl.run_batched(45);
        assert!(!outcome.success);
        assert!(outcome.error.as_deref().unwrap().contains("noise batch 2 failed"));
        assert_eq!(outcome.noise_calls, 2);
    }

    #[test]
    fn chunk_estimates_truncate_and_handle_zero_rate() {
        assert_eq!(estimate_chunks_needed(30.0, 5.0), 6);
        assert_eq!(estimate_chunks_needed(30.0, 0.0), 0);
        assert_eq!(estimate_chunks_needed(30.0, -1.0), 0);
        assert_eq!(estimate_chunks_needed(50.0, 0.62), 80);
    }
}
