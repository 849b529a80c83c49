use crate::suggestion::SuggestionService;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SuggestionConfig {
    /// Drafts shorter than this (after trimming) never reach the service.
    pub min_chars: usize,
    pub debounce: Duration,
}

impl Default for SuggestionConfig {
    fn default() -> Self {
        Self {
            min_chars: 3,
            debounce: Duration::from_millis(1000),
        }
    }
}

/// Progress of one request, stamped with the draft version that caused it.
#[derive(Debug)]
pub enum SuggestionOutcome {
    Started { version: u64 },
    Resolved { version: u64, result: Result<String> },
}

/// Debounced emoji suggestions over the current draft.
///
/// Each edit bumps the draft version and replaces the pending debounce timer.
/// Requests already sent are not aborted; their results are dropped when the
/// version they carry is no longer current.
pub struct SuggestionPipeline<S> {
    service: Arc<S>,
    config: SuggestionConfig,
    draft: String,
    version: u64,
    suggestion: Option<String>,
    busy: bool,
    timer: Option<JoinHandle<()>>,
    outcomes_tx: mpsc::UnboundedSender<SuggestionOutcome>,
    outcomes_rx: mpsc::UnboundedReceiver<SuggestionOutcome>,
}

impl<S: SuggestionService> SuggestionPipeline<S> {
    pub fn new(service: Arc<S>, config: SuggestionConfig) -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Self {
            service,
            config,
            draft: String::new(),
            version: 0,
            suggestion: None,
            busy: false,
            timer: None,
            outcomes_tx,
            outcomes_rx,
        }
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn suggestion(&self) -> Option<&str> {
        self.suggestion.as_deref()
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// The draft changed.
    pub fn edit(&mut self, text: impl Into<String>) {
        self.draft = text.into();
        self.version += 1;
        self.cancel_timer();
        self.busy = false;
        // A suggestion only ever belongs to the text that produced it.
        self.suggestion = None;

        let trimmed = self.draft.trim();
        if trimmed.chars().count() < self.config.min_chars {
            return;
        }

        let version = self.version;
        let text = trimmed.to_string();
        let service = self.service.clone();
        let tx = self.outcomes_tx.clone();
        let debounce = self.config.debounce;

        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let _ = tx.send(SuggestionOutcome::Started { version });
            // Detached from the timer so a later edit cannot abort it.
            tokio::spawn(async move {
                let result = service.suggest(&text).await;
                let _ = tx.send(SuggestionOutcome::Resolved { version, result });
            });
        }));
    }

    /// Append the shown suggestion to the draft. Does not request a new one.
    pub fn accept(&mut self) -> Option<&str> {
        let emoji = self.suggestion.take()?;
        self.draft = if self.draft.is_empty() {
            emoji
        } else {
            format!("{} {}", self.draft, emoji)
        };
        // Anything still in flight was computed for the old text.
        self.version += 1;
        self.cancel_timer();
        self.busy = false;
        Some(self.draft.as_str())
    }

    /// Reset after the draft was sent.
    pub fn clear(&mut self) {
        self.draft.clear();
        self.version += 1;
        self.cancel_timer();
        self.suggestion = None;
        self.busy = false;
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Wait for the next outcome and apply it. Returns whether it was current.
    pub async fn next_outcome(&mut self) -> bool {
        match self.outcomes_rx.recv().await {
            Some(outcome) => self.apply(outcome),
            None => false,
        }
    }

    pub fn apply(&mut self, outcome: SuggestionOutcome) -> bool {
        match outcome {
            SuggestionOutcome::Started { version } if version == self.version => {
                self.busy = true;
                true
            }
            SuggestionOutcome::Resolved { version, result } if version == self.version => {
                self.busy = false;
                self.suggestion = match result {
                    Ok(emoji) => Some(emoji),
                    Err(e) => {
                        debug!(version, "no suggestion: {:#}", e);
                        None
                    }
                };
                true
            }
            SuggestionOutcome::Started { version }
            | SuggestionOutcome::Resolved { version, .. } => {
                debug!(version, current = self.version, "discarding stale suggestion");
                false
            }
        }
    }
}

impl<S> Drop for SuggestionPipeline<S> {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::Mutex;

    /// Maps sentiment words to emoji, after an optional delay.
    struct FakeService {
        calls: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl FakeService {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                delay,
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl SuggestionService for FakeService {
        async fn suggest(&self, text: &str) -> Result<String> {
            self.calls.lock().unwrap().push(text.to_string());
            tokio::time::sleep(self.delay).await;
            if text.contains("fail") {
                bail!("model unavailable");
            }
            Ok(if text.contains("sad") { "😢" } else { "😀" }.to_string())
        }
    }

    fn pipeline(service: &Arc<FakeService>) -> SuggestionPipeline<FakeService> {
        SuggestionPipeline::new(service.clone(), SuggestionConfig::default())
    }

    async fn settles(p: &mut SuggestionPipeline<FakeService>) -> bool {
        tokio::time::timeout(Duration::from_secs(30), p.next_outcome())
            .await
            .is_err()
    }

    #[tokio::test(start_paused = true)]
    async fn short_text_never_requests() {
        let service = FakeService::new(Duration::ZERO);
        let mut p = pipeline(&service);

        p.edit("hi");
        p.edit("  hi   ");
        assert!(settles(&mut p).await);
        assert!(service.calls().is_empty());
        assert!(p.suggestion().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn edits_within_window_issue_one_request() {
        let service = FakeService::new(Duration::ZERO);
        let mut p = pipeline(&service);

        p.edit("I am so happy today");
        tokio::time::advance(Duration::from_millis(500)).await;
        p.edit("I am so happy");

        assert!(p.next_outcome().await);
        assert!(p.is_busy());
        assert!(p.next_outcome().await);
        assert!(!p.is_busy());
        assert_eq!(p.suggestion(), Some("😀"));
        assert_eq!(service.calls(), ["I am so happy"]);
        assert!(settles(&mut p).await);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_result_is_not_shown() {
        let service = FakeService::new(Duration::from_secs(5));
        let mut p = pipeline(&service);

        p.edit("I am so happy");
        assert!(p.next_outcome().await);
        assert!(p.is_busy());

        p.edit("I am so sad");
        assert!(!p.is_busy());
        assert!(p.next_outcome().await); // second request started
        assert!(!p.next_outcome().await); // first result arrives late
        assert!(p.suggestion().is_none());
        assert!(p.next_outcome().await);
        assert_eq!(p.suggestion(), Some("😢"));
        assert_eq!(service.calls(), ["I am so happy", "I am so sad"]);
    }

    #[tokio::test(start_paused = true)]
    async fn editing_hides_the_previous_suggestion() {
        let service = FakeService::new(Duration::ZERO);
        let mut p = pipeline(&service);

        p.edit("I am so happy");
        assert!(p.next_outcome().await);
        assert!(p.next_outcome().await);
        assert_eq!(p.suggestion(), Some("😀"));

        p.edit("I am so sad");
        assert!(p.suggestion().is_none());
        assert!(p.accept().is_none());
        assert_eq!(p.draft(), "I am so sad");

        assert!(p.next_outcome().await);
        assert!(p.next_outcome().await);
        assert_eq!(p.accept(), Some("I am so sad 😢"));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_means_no_suggestion_and_no_retry() {
        let service = FakeService::new(Duration::ZERO);
        let mut p = pipeline(&service);

        p.edit("this will fail");
        assert!(p.next_outcome().await);
        assert!(p.next_outcome().await);
        assert!(p.suggestion().is_none());
        assert!(!p.is_busy());
        assert!(settles(&mut p).await);
        assert_eq!(service.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn accept_appends_without_resubmitting() {
        let service = FakeService::new(Duration::ZERO);
        let mut p = pipeline(&service);

        p.edit("so happy");
        p.next_outcome().await;
        p.next_outcome().await;

        assert_eq!(p.accept(), Some("so happy 😀"));
        assert!(p.suggestion().is_none());
        assert!(p.accept().is_none());
        assert!(settles(&mut p).await);
        assert_eq!(service.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shortening_the_draft_clears_suggestion() {
        let service = FakeService::new(Duration::ZERO);
        let mut p = pipeline(&service);

        p.edit("so happy");
        p.next_outcome().await;
        p.next_outcome().await;
        assert!(p.suggestion().is_some());

        p.edit("so");
        assert!(p.suggestion().is_none());
        assert!(settles(&mut p).await);

        p.edit("so happy again");
        p.clear();
        assert_eq!(p.draft(), "");
        assert!(settles(&mut p).await);
        assert_eq!(service.calls().len(), 1);
    }
}
