//! The coordinator actor.
//!
//! A single task owns [`RecoveryState`] and every timer. Messages and timer
//! ticks are handled one at a time, so check-then-act sequences on the state
//! never interleave. Browser and peer work is spawned off the loop and
//! reports back through the mailbox where it affects the state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handle::{CoordinatorHandle, DEFAULT_MAILBOX_CAPACITY};
use super::messages::{CoordinatorMessage, NeedSource};
use super::reload::RecoveryContext;
use super::state::{CoordinatorTimings, Expiry, FastRetry, RecoveryState, SkipReason};
use crate::browser::{CookieJar, SiteTarget, TabController};
use crate::config::Settings;
use crate::logging::LoggingConfig;
use crate::peer::TokenPeer;
use crate::poll::{PollLoop, short_poll};

/// Everything the coordinator needs to run.
pub struct CoordinatorConfig {
    pub tabs: Arc<dyn TabController>,
    pub cookies: Arc<dyn CookieJar>,
    pub peer: Arc<dyn TokenPeer>,
    pub site: SiteTarget,
    pub settings: Settings,
    pub timings: CoordinatorTimings,
    /// Receives `log_filter` changes carried by new settings.
    pub logging: Option<Arc<LoggingConfig>>,
}

/// Next fire times of the periodic timers.
#[derive(Debug, Clone, Copy)]
struct PeriodicSchedule {
    short_poll: Instant,
    cookie: Instant,
    safety_sweep: Instant,
    auto_reload: Option<Instant>,
}

impl PeriodicSchedule {
    fn starting_at(now: Instant, timings: &CoordinatorTimings, auto_reload: Option<Duration>) -> Self {
        Self {
            short_poll: now + timings.short_poll_first,
            cookie: now + timings.cookie_first,
            safety_sweep: now + timings.safety_sweep_interval,
            auto_reload: auto_reload.map(|period| now + period),
        }
    }
}

pub struct Coordinator {
    state: RecoveryState,
    ctx: Arc<RecoveryContext>,
    settings: Settings,
    logging: Option<Arc<LoggingConfig>>,
    poll: PollLoop,
    schedule: PeriodicSchedule,
    poll_restart_at: Option<Instant>,
    mailbox: mpsc::Receiver<CoordinatorMessage>,
    handle: CoordinatorHandle,
    cancellation_token: CancellationToken,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        cancellation_token: CancellationToken,
    ) -> (Self, CoordinatorHandle) {
        let (tx, rx) = mpsc::channel(DEFAULT_MAILBOX_CAPACITY);
        let handle = CoordinatorHandle::new(tx, cancellation_token.clone());
        let settings = config.settings.normalized();
        let poll = PollLoop::new(
            Arc::clone(&config.peer),
            handle.clone(),
            cancellation_token.child_token(),
        );
        let schedule = PeriodicSchedule::starting_at(
            Instant::now(),
            &config.timings,
            settings.auto_reload_interval(),
        );
        let ctx = Arc::new(RecoveryContext {
            tabs: config.tabs,
            cookies: config.cookies,
            peer: config.peer,
            site: config.site,
            timings: config.timings.clone(),
        });

        let coordinator = Self {
            state: RecoveryState::new(config.timings),
            ctx,
            settings,
            logging: config.logging,
            poll,
            schedule,
            poll_restart_at: None,
            mailbox: rx,
            handle: handle.clone(),
            cancellation_token,
        };
        (coordinator, handle)
    }

    /// Spawn the coordinator onto the runtime.
    pub fn spawn(
        config: CoordinatorConfig,
        cancellation_token: CancellationToken,
    ) -> (CoordinatorHandle, JoinHandle<()>) {
        let (coordinator, handle) = Self::new(config, cancellation_token);
        let task = tokio::spawn(coordinator.run());
        (handle, task)
    }

    fn timings(&self) -> &CoordinatorTimings {
        self.state.timings()
    }

    /// Run until a `Stop` message arrives or the token is cancelled.
    pub async fn run(mut self) {
        info!(site = %self.ctx.site.host(), "Coordinator starting");
        self.schedule = PeriodicSchedule::starting_at(
            Instant::now(),
            self.timings(),
            self.settings.auto_reload_interval(),
        );
        self.poll.start();

        loop {
            tokio::select! {
                biased;

                _ = self.cancellation_token.cancelled() => {
                    info!("Coordinator cancelled");
                    break;
                }

                msg = self.mailbox.recv() => match msg {
                    Some(CoordinatorMessage::Stop) | None => {
                        debug!("Coordinator received stop signal");
                        break;
                    }
                    Some(msg) => self.handle_message(msg),
                },

                _ = sleep_until_opt(self.state.deadline()) => self.on_token_timeout(),
                _ = sleep_until_opt(self.state.next_fast_retry()) => self.on_fast_retry(),
                _ = sleep_until_opt(self.state.backup_alarm()) => self.on_backup_alarm(),
                _ = sleep_until_opt(self.poll_restart_at) => {
                    self.poll_restart_at = None;
                    self.poll.start();
                }

                _ = sleep_until(self.schedule.short_poll) => self.on_poll_alarm(),
                _ = sleep_until(self.schedule.cookie) => self.on_cookie_alarm(),
                _ = sleep_until(self.schedule.safety_sweep) => self.on_safety_sweep(),
                _ = sleep_until_opt(self.schedule.auto_reload) => self.on_auto_reload(),
            }
        }

        self.poll.stop();
        info!("Coordinator stopped");
    }

    fn handle_message(&mut self, msg: CoordinatorMessage) {
        let now = Instant::now();
        match msg {
            CoordinatorMessage::TokenNeeded { source } => {
                let reason = match source {
                    NeedSource::LongPoll => "long poll",
                    NeedSource::ShortPoll => "short poll",
                };
                self.request_recovery(reason);
                self.state.start_burst(now);
            }
            CoordinatorMessage::TokenCaptured(submission) => {
                info!(
                    has_pawtect = submission.pawtect.is_some(),
                    has_fp = submission.fp.is_some(),
                    "Token captured, forwarding to peer"
                );
                self.state.token_delivered(now);
                let ctx = Arc::clone(&self.ctx);
                tokio::spawn(async move { ctx.submit_token(&submission).await });
            }
            CoordinatorMessage::ReloadIssued { cycle } => {
                if !self.state.reload_issued(cycle, now) {
                    debug!(cycle, "Ignoring reload report from a finished cycle");
                }
            }
            CoordinatorMessage::SettingsUpdated { settings, reply } => {
                self.apply_settings(settings, now);
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            CoordinatorMessage::SendCookie { reply } => {
                self.spawn_effect(move |ctx| async move {
                    let result = ctx.send_cookie().await;
                    info!(success = result.success, "Cookie send status");
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                });
            }
            CoordinatorMessage::QuickLogout { reply } => {
                self.spawn_effect(move |ctx| async move {
                    let result = ctx.quick_logout().await;
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                });
            }
            CoordinatorMessage::ComputeSignature { tab_id, body } => {
                self.spawn_effect(move |ctx| async move {
                    ctx.compute_signature(tab_id, &body).await
                });
            }
            CoordinatorMessage::TabUpdated {
                tab_id,
                url,
                status,
            } => {
                self.spawn_effect(move |ctx| async move {
                    ctx.on_tab_updated(tab_id, url.as_deref(), status).await
                });
            }
            CoordinatorMessage::GetState(reply) => {
                let _ = reply.send(self.state.snapshot(now));
            }
            CoordinatorMessage::Stop => {}
        }
    }

    fn spawn_effect<F, Fut>(&self, effect: F)
    where
        F: FnOnce(Arc<RecoveryContext>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(effect(Arc::clone(&self.ctx)));
    }

    /// Start a recovery cycle unless one is running or the cooldown holds.
    fn request_recovery(&mut self, reason: &'static str) -> bool {
        match self.state.begin(Instant::now()) {
            Err(SkipReason::InProgress) => {
                debug!(reason, "Recovery already in progress");
                false
            }
            Err(SkipReason::Cooldown { remaining }) => {
                debug!(
                    reason,
                    remaining_ms = remaining.as_millis() as u64,
                    "Recovery skipped, reloaded recently"
                );
                false
            }
            Ok(cycle) => {
                info!(reason, cycle, "Starting token recovery");
                let ctx = Arc::clone(&self.ctx);
                let handle = self.handle.clone();
                tokio::spawn(async move {
                    ctx.prepare_and_reload().await;
                    if let Err(e) = handle.send(CoordinatorMessage::ReloadIssued { cycle }).await {
                        debug!(error = %e, "Could not report reload");
                    }
                });
                true
            }
        }
    }

    fn on_token_timeout(&mut self) {
        let now = Instant::now();
        match self.state.expire(now) {
            Expiry::Expired => {
                warn!("Token wait timed out, retrying");
                self.request_recovery("token timeout");
                self.state.start_burst(now);
            }
            Expiry::Extended => {
                warn!(cycle = ?self.state.current_cycle(), "Tab preparation still running, extending token wait");
            }
            Expiry::NotDue => {}
        }
    }

    fn on_fast_retry(&mut self) {
        if let FastRetry::Due { request: true } = self.state.take_fast_retry(Instant::now()) {
            self.request_recovery("fast retry");
        }
    }

    fn on_backup_alarm(&mut self) {
        if self.state.take_backup_alarm(Instant::now()) {
            warn!("Token wait backup alarm fired, retrying");
            self.request_recovery("backup alarm");
        }
    }

    fn on_poll_alarm(&mut self) {
        self.schedule.short_poll = Instant::now() + self.timings().short_poll_interval;
        if !self.poll.is_active() && self.poll_restart_at.is_none() {
            self.poll.start();
        }

        let peer = Arc::clone(&self.ctx.peer);
        let handle = self.handle.clone();
        tokio::spawn(async move {
            short_poll(peer.as_ref(), &handle).await;
        });
    }

    fn on_cookie_alarm(&mut self) {
        self.schedule.cookie = Instant::now() + self.timings().cookie_interval;
        debug!("Periodic cookie refresh");
        self.spawn_effect(|ctx| async move {
            let result = ctx.send_cookie().await;
            info!(success = result.success, "Periodic cookie refresh");
        });
    }

    fn on_safety_sweep(&mut self) {
        let now = Instant::now();
        self.schedule.safety_sweep = now + self.timings().safety_sweep_interval;
        if !self.state.safety_sweep_due(now) {
            return;
        }

        info!("No recent reload, refreshing site tabs");
        self.state.sweep_reloaded(now);
        self.spawn_effect(|ctx| async move {
            let count = ctx.reload_all_site_tabs().await;
            debug!(count, "Safety sweep reloaded tabs");
        });
    }

    fn on_auto_reload(&mut self) {
        self.schedule.auto_reload = self
            .settings
            .auto_reload_interval()
            .map(|period| Instant::now() + period);
        self.spawn_effect(|ctx| async move {
            let count = ctx.reload_all_site_tabs().await;
            info!(count, "Auto-reloaded site tabs");
        });
    }

    fn apply_settings(&mut self, settings: Settings, now: Instant) {
        let settings = settings.normalized();
        info!(
            peer = %settings.peer_base_url(),
            auto_reload_secs = settings.auto_reload_secs,
            "Settings updated, restarting poll and timers"
        );

        self.poll.stop();
        self.ctx.peer.update_settings(&settings);
        self.poll_restart_at = Some(now + self.timings().poll_restart_delay);
        self.state.reset();
        self.schedule =
            PeriodicSchedule::starting_at(now, self.timings(), settings.auto_reload_interval());

        if let (Some(filter), Some(logging)) = (&settings.log_filter, &self.logging)
            && let Err(e) = logging.set_filter(filter)
        {
            warn!(error = %e, "Failed to apply log filter");
        }
        self.settings = settings;
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
