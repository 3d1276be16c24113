use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use flowcast_core::UpstreamError;
use parking_lot::Mutex;

use crate::flows::{FlowNode, FlowSource};

/// Pre-programmed answer for one `fetch_flows` call.
#[derive(Clone, Debug)]
pub enum MockResponse {
    Flows(Vec<FlowNode>),
    Error(UpstreamError),
}

/// Flow source that replays scripted responses in order. Once the script runs
/// out, the last response repeats, so a steady state can be scripted with a
/// single entry.
pub struct MockFlowSource {
    responses: Mutex<VecDeque<MockResponse>>,
    last: Mutex<Option<MockResponse>>,
    call_count: AtomicUsize,
}

impl MockFlowSource {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            last: Mutex::new(None),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Append a response to the end of the script.
    pub fn push(&self, response: MockResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FlowSource for MockFlowSource {
    async fn fetch_flows(&self) -> Result<Vec<FlowNode>, UpstreamError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);

        let next = self.responses.lock().pop_front();
        let response = match next {
            Some(response) => {
                *self.last.lock() = Some(response.clone());
                response
            }
            None => self
                .last
                .lock()
                .clone()
                .unwrap_or(MockResponse::Flows(Vec::new())),
        };

        match response {
            MockResponse::Flows(nodes) => Ok(nodes),
            MockResponse::Error(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_in_order_then_repeats_last() {
        let source = MockFlowSource::new(vec![
            MockResponse::Error(UpstreamError::Network("down".into())),
            MockResponse::Flows(vec![FlowNode::tab("t1", "Main")]),
        ]);

        assert!(source.fetch_flows().await.is_err());
        assert_eq!(source.fetch_flows().await.unwrap().len(), 1);
        assert_eq!(source.fetch_flows().await.unwrap().len(), 1);
        assert_eq!(source.call_count(), 3);
    }

    #[tokio::test]
    async fn empty_script_yields_no_flows() {
        let source = MockFlowSource::new(vec![]);
        assert!(source.fetch_flows().await.unwrap().is_empty());

        source.push(MockResponse::Error(UpstreamError::RateLimited));
        assert!(matches!(
            source.fetch_flows().await,
            Err(UpstreamError::RateLimited)
        ));
    }
}
