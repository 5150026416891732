//! Bot runner: owns the session controller and executes its actions.
//!
//! Handles:
//! - Authorizing and (re)subscribing on every connection
//! - Routing venue messages into the controller
//! - Sending requests to Deriv, or to the paper venue in paper mode
//! - Scheduling controller wake-ups
//! - Broadcasting status events to the control surface

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::api::{
    ClientConfig, DerivClient, DerivHandle, Request, Response, TransportEvent, VenueMessage,
};
use crate::error::TradingError;
use crate::models::SessionSummary;
use crate::paper::{PaperConfig, PaperVenue};
use crate::router::{Inbound, VenueRouter};
use crate::trading::{
    Action, BotParams, SessionController, SessionEvent, StatusEvent, SystemClock, TradingConfig,
    Wake,
};

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub client: ClientConfig,

    /// Deriv API token, required unless paper trading
    pub token: Option<String>,

    /// Engine tuning
    pub trading: TradingConfig,

    /// Simulated order venue; `None` trades for real
    pub paper: Option<PaperConfig>,

    /// Leave the run loop once the session halts and nothing is in flight
    pub exit_when_finished: bool,
}

/// Commands from the control surface.
#[derive(Debug, Clone)]
pub enum ControlCommand {
    Start(BotParams),
    Stop,
    Shutdown,
}

/// Main bot runner.
pub struct Bot {
    config: RunConfig,
    controller: SessionController,
    router: VenueRouter,
    paper: Option<PaperVenue>,
    status: broadcast::Sender<StatusEvent>,
    wake_tx: mpsc::UnboundedSender<Wake>,
    wake_rx: mpsc::UnboundedReceiver<Wake>,

    // Connection state
    authorized: bool,
    pending_start: Option<BotParams>,

    /// Start failure with no session to fall back on
    failure: Option<TradingError>,
}

impl Bot {
    pub fn new(config: RunConfig) -> Result<Self> {
        if config.paper.is_none() && config.token.is_none() {
            return Err(anyhow!("A Deriv API token is required for live trading"));
        }

        let controller = SessionController::new(config.trading.clone(), Arc::new(SystemClock));
        let paper = config.paper.clone().map(PaperVenue::new);
        let (status, _) = broadcast::channel(1024);
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            controller,
            router: VenueRouter::new(),
            paper,
            status,
            wake_tx,
            wake_rx,
            authorized: false,
            pending_start: None,
            failure: None,
        })
    }

    /// Subscribe to status events.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    pub fn summary(&self) -> Option<SessionSummary> {
        self.controller.session().map(|s| s.snapshot())
    }

    /// Main run loop. Returns when shut down, when the session finishes
    /// (if configured), or when the transport gives up.
    pub async fn run(&mut self, mut commands: mpsc::UnboundedReceiver<ControlCommand>) -> Result<()> {
        info!(
            endpoint = %self.config.client.endpoint,
            paper = self.paper.is_some(),
            "Starting bot run loop"
        );

        let (handle, mut transport) = DerivClient::spawn(self.config.client.clone());
        let result = self.event_loop(&handle, &mut transport, &mut commands).await;

        handle.shutdown().await;
        info!("Bot stopped");
        result
    }

    async fn event_loop(
        &mut self,
        handle: &DerivHandle,
        transport: &mut mpsc::UnboundedReceiver<TransportEvent>,
        commands: &mut mpsc::UnboundedReceiver<ControlCommand>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                event = transport.recv() => {
                    let Some(event) = event else {
                        return Err(anyhow!("Deriv transport closed"));
                    };
                    match event {
                        TransportEvent::Connected => {
                            self.authorized = false;
                            self.router.reset_streams();
                            let actions = self.on_connected();
                            self.execute(handle, actions);
                        }
                        TransportEvent::Message(response) => {
                            let mut queue = VecDeque::new();
                            self.on_response(response, &mut queue);
                            self.drain(handle, queue);
                        }
                        TransportEvent::Disconnected(reason) => {
                            warn!(reason = %reason, "Disconnected from Deriv, reconnecting");
                            self.authorized = false;
                        }
                        TransportEvent::Failed(reason) => {
                            error!(reason = %reason, "Deriv transport failed");
                            return Err(anyhow!("Deriv transport failed: {}", reason));
                        }
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(ControlCommand::Start(params)) => {
                            if self.authorized {
                                let actions = self.start_session(params);
                                self.execute(handle, actions);
                            } else {
                                debug!("Start deferred until authorized");
                                self.pending_start = Some(params);
                            }
                        }
                        Some(ControlCommand::Stop) => {
                            info!("Stop requested");
                            let actions = self.controller.stop();
                            self.execute(handle, actions);
                        }
                        Some(ControlCommand::Shutdown) | None => {
                            info!("Shutdown requested");
                            return Ok(());
                        }
                    }
                }
                Some(wake) = self.wake_rx.recv() => {
                    let actions = self.controller.handle(SessionEvent::Wake(wake));
                    self.execute(handle, actions);
                }
            }

            if let Some(e) = self.failure.take() {
                return Err(e.into());
            }
            if self.config.exit_when_finished && self.controller.is_finished() {
                info!("Session finished");
                return Ok(());
            }
        }
    }

    fn on_connected(&mut self) -> Vec<Action> {
        match self.config.token.clone() {
            Some(token) => vec![Action::Send(Request::Authorize { token })],
            // Paper trading without an account
            None => self.on_authorized(),
        }
    }

    fn on_authorized(&mut self) -> Vec<Action> {
        self.authorized = true;

        if self.controller.session().is_some() {
            info!("Restoring session subscriptions");
            return self.controller.resubscribe();
        }

        match self.pending_start.take() {
            Some(params) => self.start_session(params),
            None => Vec::new(),
        }
    }

    fn start_session(&mut self, params: BotParams) -> Vec<Action> {
        match self.controller.start(&params) {
            Ok(actions) => actions,
            Err(e) => {
                error!(kind = %e.kind(), "Failed to start session: {}", e);
                let event = StatusEvent::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                };
                if self.controller.session().is_none() {
                    self.failure = Some(e);
                }
                vec![Action::Publish(event)]
            }
        }
    }

    fn on_response(&mut self, response: Response, queue: &mut VecDeque<Action>) {
        // Paper contracts settle on the same tick the controller sees
        if let VenueMessage::Tick { quote, .. } = &response.message {
            let settlements = self
                .paper
                .as_mut()
                .map(|paper| paper.on_tick(*quote))
                .unwrap_or_default();
            for settlement in settlements {
                self.on_response(settlement, queue);
            }
        }

        for inbound in self.router.route(response) {
            match inbound {
                Inbound::Session(event) => queue.extend(self.controller.handle(event)),
                Inbound::Authorized { .. } => queue.extend(self.on_authorized()),
                Inbound::Send(request) => queue.push_back(Action::Send(request)),
            }
        }
    }

    fn execute(&mut self, handle: &DerivHandle, actions: Vec<Action>) {
        self.drain(handle, actions.into());
    }

    fn drain(&mut self, handle: &DerivHandle, mut queue: VecDeque<Action>) {
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Send(request) => {
                    let served = self.paper.as_mut().and_then(|paper| paper.submit(&request));
                    match served {
                        Some(responses) => {
                            for response in responses {
                                self.on_response(response, &mut queue);
                            }
                        }
                        None => {
                            if let Err(e) = handle.send(request) {
                                warn!("Failed to send request: {}", e);
                            }
                        }
                    }
                }
                Action::Schedule { after, wake } => {
                    let wake_tx = self.wake_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = wake_tx.send(wake);
                    });
                }
                Action::Publish(event) => {
                    // No subscribers is fine
                    let _ = self.status.send(event);
                }
            }
        }
    }
}
