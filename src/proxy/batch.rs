// 批量任务队列：单 worker 顺序提交并轮询，支持停止
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

use crate::modules::config::BatchConfig;
use crate::proxy::generation::{GenerateRequest, GenerationService};
use crate::proxy::mappers::sora::JobStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchItemState {
    Queued,
    Submitted,
    Complete,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    pub id: String,
    pub prompt: String,
    pub state: BatchItemState,
    pub job_id: Option<String>,
    pub url: Option<String>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct QueuedItem {
    id: String,
    request: GenerateRequest,
}

pub struct BatchQueue {
    generation: Arc<GenerationService>,
    poll_interval: Duration,
    max_polls: u32,
    queue: Mutex<VecDeque<QueuedItem>>,
    items: DashMap<String, BatchItem>,
    stop: Arc<AtomicBool>,
    running: AtomicBool,
}

impl BatchQueue {
    pub fn new(generation: Arc<GenerationService>, config: &BatchConfig) -> Self {
        Self {
            generation,
            poll_interval: Duration::from_millis(config.status_poll_interval_ms),
            max_polls: config.max_status_polls,
            queue: Mutex::new(VecDeque::new()),
            items: DashMap::new(),
            stop: Arc::new(AtomicBool::new(false)),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Queue one item per non-empty prompt; starts the worker when idle.
    pub fn enqueue(self: &Arc<Self>, prompts: Vec<String>, params: Map<String, Value>) -> Vec<String> {
        let now = Utc::now();
        let mut ids = Vec::new();
        {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            for prompt in prompts.into_iter().map(|p| p.trim().to_string()) {
                if prompt.is_empty() {
                    continue;
                }
                let id = uuid::Uuid::new_v4().to_string();
                self.items.insert(
                    id.clone(),
                    BatchItem {
                        id: id.clone(),
                        prompt: prompt.clone(),
                        state: BatchItemState::Queued,
                        job_id: None,
                        url: None,
                        message: None,
                        created_at: now,
                        updated_at: now,
                    },
                );
                queue.push_back(QueuedItem {
                    id: id.clone(),
                    request: GenerateRequest {
                        prompt,
                        params: params.clone(),
                        file: None,
                    },
                });
                ids.push(id);
            }
        }

        if !ids.is_empty() {
            self.stop.store(false, Ordering::SeqCst);
            self.ensure_worker();
            tracing::info!("[Batch] Enqueued {} item(s)", ids.len());
        }
        ids
    }

    /// Stop the worker at its next boundary and cancel everything still queued.
    pub fn stop(&self) -> usize {
        self.stop.store(true, Ordering::SeqCst);
        let drained: Vec<QueuedItem> = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.drain(..).collect()
        };
        for item in &drained {
            self.update(&item.id, |it| {
                it.state = BatchItemState::Cancelled;
                it.message = Some("stopped before submission".to_string());
            });
        }
        tracing::warn!("[Batch] Stop requested, {} queued item(s) cancelled", drained.len());
        drained.len()
    }

    pub fn items(&self) -> Vec<BatchItem> {
        let mut items: Vec<BatchItem> = self.items.iter().map(|e| e.value().clone()).collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        items
    }

    pub fn item(&self, id: &str) -> Option<BatchItem> {
        self.items.get(id).map(|e| e.value().clone())
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut BatchItem)) {
        if let Some(mut entry) = self.items.get_mut(id) {
            f(entry.value_mut());
            entry.updated_at = Utc::now();
        }
    }

    fn pop_next(&self) -> Option<QueuedItem> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    fn queue_is_empty(&self) -> bool {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    fn ensure_worker(self: &Arc<Self>) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tokio::spawn(self.clone().run_worker());
        }
    }

    async fn run_worker(self: Arc<Self>) {
        tracing::debug!("[Batch] Worker started");
        loop {
            while !self.stop.load(Ordering::SeqCst) {
                let Some(item) = self.pop_next() else { break };
                self.process(item).await;
            }
            self.running.store(false, Ordering::SeqCst);

            // enqueue 可能发生在上面退出循环与清除 running 之间
            if self.stop.load(Ordering::SeqCst) || self.queue_is_empty() {
                break;
            }
            if self
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                break;
            }
        }
        tracing::debug!("[Batch] Worker idle");
    }

    async fn process(&self, item: QueuedItem) {
        let QueuedItem { id, request } = item;

        let job_id = match self.generation.generate(request).await {
            Ok(job_id) => job_id,
            Err(e) => {
                tracing::warn!("[Batch] Item {} submit failed: {}", id, e);
                self.update(&id, |it| {
                    it.state = BatchItemState::Error;
                    it.message = Some(e.to_string());
                });
                return;
            }
        };
        self.update(&id, |it| {
            it.state = BatchItemState::Submitted;
            it.job_id = Some(job_id.clone());
        });

        for _ in 0..self.max_polls {
            if self.stop.load(Ordering::SeqCst) {
                self.update(&id, |it| {
                    it.state = BatchItemState::Cancelled;
                    it.message = Some("stopped while polling".to_string());
                });
                return;
            }
            tokio::time::sleep(self.poll_interval).await;

            match self.generation.check_status(&job_id).await {
                Ok(JobStatus::Processing) => {}
                Ok(JobStatus::Complete { url }) => {
                    self.update(&id, |it| {
                        it.state = BatchItemState::Complete;
                        it.url = Some(url);
                    });
                    return;
                }
                Ok(JobStatus::Error { message }) => {
                    self.update(&id, |it| {
                        it.state = BatchItemState::Error;
                        it.message = Some(message);
                    });
                    return;
                }
                Err(e) => {
                    tracing::debug!("[Batch] Status poll for {} failed: {}", job_id, e);
                }
            }
        }

        self.update(&id, |it| {
            it.state = BatchItemState::Error;
            it.message = Some(format!("no terminal status after {} polls", self.max_polls));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::config::{TokenSourceConfig, UpstreamConfig};
    use crate::proxy::captcha::CaptchaSolver;
    use crate::proxy::dispatcher::Dispatcher;
    use crate::proxy::token_source::TokenSource;

    fn empty_pool_queue() -> Arc<BatchQueue> {
        let http = reqwest::Client::new();
        let upstream = UpstreamConfig::default();
        let dispatcher = Arc::new(Dispatcher::new(
            http.clone(),
            &upstream,
            TokenSource::new(http.clone(), &TokenSourceConfig::default()),
            CaptchaSolver::new(http, Default::default()),
        ));
        let generation = Arc::new(GenerationService::new(dispatcher, &upstream));
        Arc::new(BatchQueue::new(
            generation,
            &BatchConfig {
                status_poll_interval_ms: 10,
                max_status_polls: 2,
            },
        ))
    }

    async fn wait_idle(queue: &BatchQueue) {
        for _ in 0..200 {
            if !queue.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("batch worker did not go idle");
    }

    #[tokio::test]
    async fn blank_prompts_are_skipped() {
        let queue = empty_pool_queue();
        let ids = queue.enqueue(vec!["  ".into(), String::new()], Map::new());
        assert!(ids.is_empty());
        assert!(!queue.is_running());
        assert!(queue.items().is_empty());
    }

    #[tokio::test]
    async fn submit_failures_mark_items_error() {
        let queue = empty_pool_queue();
        let ids = queue.enqueue(vec!["one".into(), "two".into()], Map::new());
        assert_eq!(ids.len(), 2);
        wait_idle(&queue).await;

        for id in ids {
            let item = queue.item(&id).unwrap();
            assert_eq!(item.state, BatchItemState::Error);
            assert_eq!(item.message.as_deref(), Some("No tokens available"));
        }
    }

    #[tokio::test]
    async fn items_serialize_with_rfc3339_timestamps() {
        let queue = empty_pool_queue();
        let ids = queue.enqueue(vec!["sunrise".into()], Map::new());
        wait_idle(&queue).await;

        let v = serde_json::to_value(queue.item(&ids[0]).unwrap()).unwrap();
        assert_eq!(v["prompt"], "sunrise");
        assert_eq!(v["state"], "error");
        let created = v["created_at"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(created).is_ok(), "{}", created);
        assert!(v["updated_at"].is_string());
    }

    #[tokio::test]
    async fn stop_cancels_queued_items() {
        let queue = empty_pool_queue();
        let ids = queue.enqueue(vec!["a".into(), "b".into(), "c".into()], Map::new());
        queue.stop();
        wait_idle(&queue).await;

        let items = queue.items();
        assert_eq!(items.len(), ids.len());
        assert!(items
            .iter()
            .all(|it| matches!(it.state, BatchItemState::Error | BatchItemState::Cancelled)));
    }
}
