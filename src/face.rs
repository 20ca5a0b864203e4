//! Live monitor: streams loop events to a browser over SSE.

use std::convert::Infallible;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::Html;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info};

const CHANNEL_CAPACITY: usize = 64;

/// What the loop is doing, as seen from the monitor page.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    TaskStarted {
        task_id: String,
        kind: String,
    },
    Thinking {
        step: usize,
    },
    Decision {
        step: usize,
        action: String,
        thought: String,
    },
    Observation {
        step: usize,
        text: String,
    },
    TaskFinished {
        task_id: String,
        steps: usize,
    },
    TaskFailed {
        task_id: String,
        failed_action: String,
        message: String,
    },
}

impl AgentEvent {
    fn name(&self) -> &'static str {
        match self {
            AgentEvent::TaskStarted { .. } => "task_started",
            AgentEvent::Thinking { .. } => "thinking",
            AgentEvent::Decision { .. } => "decision",
            AgentEvent::Observation { .. } => "observation",
            AgentEvent::TaskFinished { .. } => "task_finished",
            AgentEvent::TaskFailed { .. } => "task_failed",
        }
    }

    fn to_sse_event(&self) -> Event {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        Event::default().event(self.name()).data(data)
    }
}

/// Sending half of the event stream. Emitting with no subscribers is a no-op.
#[derive(Clone, Debug)]
pub struct Monitor {
    tx: broadcast::Sender<AgentEvent>,
}

impl Default for Monitor {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl Monitor {
    pub fn emit(&self, event: AgentEvent) {
        debug!(event = event.name(), "monitor event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(index_handler))
            .route("/events", get(sse_handler))
            .route(
                "/favicon.ico",
                get(|| async { axum::http::StatusCode::NO_CONTENT }),
            )
            .with_state(self.clone())
    }

    /// Bind `addr` and serve the monitor in the background.
    pub async fn serve(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind monitor on {addr}"))?;
        let bound = listener.local_addr().context("monitor local address")?;
        let app = self.router();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "monitor server stopped");
            }
        });
        info!(addr = %bound, "monitor listening");
        Ok(bound)
    }
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn sse_handler(
    State(monitor): State<Monitor>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(monitor.subscribe())
        .filter_map(|result| result.ok().map(|event| Ok(event.to_sse_event())));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<title>Group Agent</title>
<style>
  body { background: #0a0a0f; color: #e0e0e0; font-family: system-ui, sans-serif; margin: 0; }
  header { padding: 20px 32px; border-bottom: 1px solid #1a1a2e; font-size: 20px; color: #fff; }
  #log { max-width: 860px; margin: 0 auto; padding: 24px 32px; display: flex; flex-direction: column; gap: 8px; }
  .entry { padding: 10px 14px; border-radius: 8px; font-size: 14px; line-height: 1.5; background: #111118; }
  .task_started { border-left: 3px solid #6366f1; }
  .thinking { border-left: 3px solid #f59e0b; color: #fcd34d; }
  .decision { border-left: 3px solid #3b82f6; font-family: monospace; }
  .observation { border-left: 3px solid #64748b; }
  .task_finished { border-left: 3px solid #22c55e; color: #86efac; }
  .task_failed { border-left: 3px solid #ef4444; color: #fca5a5; }
</style>
</head>
<body>
<header>Group Agent</header>
<div id="log"></div>
<script>
  const log = document.getElementById('log');
  const esc = s => String(s).replace(/</g, '&lt;');
  const render = {
    task_started: d => 'Task ' + esc(d.task_id) + ' (' + esc(d.kind) + ')',
    thinking: d => 'Step ' + d.step + ': thinking...',
    decision: d => 'Step ' + d.step + ': ' + esc(d.action) + ' - ' + esc(d.thought),
    observation: d => esc(d.text),
    task_finished: d => 'Finished ' + esc(d.task_id) + ' in ' + d.steps + ' steps',
    task_failed: d => 'Failed at ' + esc(d.failed_action) + ': ' + esc(d.message),
  };
  const es = new EventSource('/events');
  for (const name of Object.keys(render)) {
    es.addEventListener(name, e => {
      const div = document.createElement('div');
      div.className = 'entry ' + name;
      div.innerHTML = render[name](JSON.parse(e.data));
      log.appendChild(div);
      window.scrollTo(0, document.body.scrollHeight);
    });
  }
</script>
</body>
</html>
"##;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_their_name() {
        let event = AgentEvent::Decision {
            step: 2,
            action: "likePost".into(),
            thought: "like it".into(),
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["event"], event.name());
        assert_eq!(v["action"], "likePost");
    }

    #[tokio::test]
    async fn subscribers_see_emitted_events() {
        let monitor = Monitor::default();
        monitor.emit(AgentEvent::Thinking { step: 0 });
        let mut rx = monitor.subscribe();
        monitor.emit(AgentEvent::Thinking { step: 1 });
        assert_eq!(rx.recv().await.unwrap(), AgentEvent::Thinking { step: 1 });
    }

    #[tokio::test]
    async fn serves_on_an_ephemeral_port() {
        let monitor = Monitor::default();
        let addr = monitor.serve("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_ne!(addr.port(), 0);
    }
}
