//! Binds live and event sessions into the worker pool

use crate::config::WebRtcConfig;
use crate::session::{EventSession, LiveSession, SessionEnv};
use crate::Result;
use async_trait::async_trait;
use camstream_core::{
    PortPool, SessionContext, SessionLauncher, SessionOutcome, SessionSource, StartRequest,
    TranscoderConfig,
};
use std::sync::Arc;
use tracing::warn;

/// [`SessionLauncher`] that picks the session flavor from the request
pub struct StreamLauncher {
    env: Arc<SessionEnv>,
}

impl StreamLauncher {
    pub fn new(webrtc: WebRtcConfig, transcoder: TranscoderConfig, ports: PortPool) -> Result<Self> {
        webrtc.validate()?;
        transcoder.validate()?;
        Ok(Self {
            env: Arc::new(SessionEnv {
                webrtc,
                transcoder,
                ports,
            }),
        })
    }
}

#[async_trait]
impl SessionLauncher for StreamLauncher {
    async fn run(&self, request: StartRequest, ctx: SessionContext) -> SessionOutcome {
        let target = match request.output_target() {
            Ok(target) => target.to_string(),
            Err(e) => return SessionOutcome::failed(e),
        };
        match request.source() {
            Ok(SessionSource::Live(credential)) => {
                LiveSession::new(Arc::clone(&self.env), request.identity(), credential, target)
                    .run(ctx)
                    .await
            }
            Ok(SessionSource::Recording { url }) => {
                EventSession::new(Arc::clone(&self.env), request.device_id.clone(), url, target)
                    .run(ctx)
                    .await
            }
            Err(e) => {
                warn!(device_id = %request.device_id, "unusable start request: {}", e);
                SessionOutcome::failed(e)
            }
        }
    }
}
