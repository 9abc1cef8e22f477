//! The per-pool stratum client: connection supervisor, receive loop and
//! share sender.
//!
//! Each stratum pool gets one [`stratum_task`] for its lifetime. It connects,
//! subscribes and authorizes, then reads messages until the connection dies,
//! reconnecting with a backoff. Shares arrive on the pool's outbound queue
//! and are written by a separate send loop, which outlives individual
//! connections so a share can be resent after a reconnect that resumes the
//! same session.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use super::connection::{self, MessageReader, MessageWriter};
use super::error::{StratumError, StratumResult};
use super::messages::{JobNotification, JsonRpcMessage, SubmitParams, Subscription};
use super::work::{build_job, gen_stratum_work};
use crate::engine::Engine;
use crate::pool::{Capabilities, InflightShare, Pool, StratumSession};
use crate::submit::{self, reject_reason, ShareOutcome};
use crate::tracing::prelude::*;
use crate::work::{StratumFields, Work, WorkFlags};

/// The pool is considered gone after this long without a message.
pub const READ_TIMEOUT: Duration = Duration::from_secs(90);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for the answer to a handshake request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shares are resent for this long while the session id is unchanged.
pub const RESUBMIT_WINDOW: Duration = Duration::from_secs(120);

const RESUBMIT_INTERVAL: Duration = Duration::from_secs(5);

/// Reconnect delay, and the shorter one used when this is the only pool.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(30);
pub const SOLE_POOL_BACKOFF: Duration = Duration::from_secs(5);

const USER_AGENT: &str = concat!("mujina-dispatch/", env!("CARGO_PKG_VERSION"));

/// Writing half of the live connection, if any.
type SharedWriter = Arc<Mutex<Option<MessageWriter>>>;

fn reconnect_delay(engine: &Engine) -> Duration {
    if engine.registry.enabled_count() <= 1 {
        SOLE_POOL_BACKOFF
    } else {
        RECONNECT_BACKOFF
    }
}

/// Run the stratum client for `pool` until shutdown or removal.
pub async fn stratum_task(engine: Arc<Engine>, pool: Arc<Pool>) {
    pool.set_capabilities(pool.capabilities() | Capabilities::STRATUM);

    let writer: SharedWriter = Arc::new(Mutex::new(None));
    let (tx, rx) = mpsc::unbounded_channel();
    pool.set_outbound(Some(tx));
    engine
        .tasks
        .spawn(send_loop(engine.clone(), pool.clone(), rx, writer.clone()));

    loop {
        if engine.shutdown.is_cancelled() || pool.is_removed() {
            break;
        }

        let result = run_connection(&engine, &pool, &writer).await;
        let was_active = pool.stratum_active();
        teardown(&engine, &pool, &writer).await;

        let delay = match result {
            Ok(()) => break,
            Err(StratumError::ReconnectRequested) => {
                info!(pool = %pool.url, "Pool {} requested reconnect", pool.pool_no());
                Duration::ZERO
            }
            Err(e) => {
                let delay = reconnect_delay(&engine);
                if was_active {
                    warn!(pool = %pool.url, error = %e, "Stratum connection to pool {} lost", pool.pool_no());
                } else if e.is_auth() {
                    error!(pool = %pool.url, error = %e, "Pool {} refused our credentials", pool.pool_no());
                } else {
                    warn!(
                        pool = %pool.url,
                        error = %e,
                        "Failed to connect stratum on pool {}, retrying in {}s",
                        pool.pool_no(),
                        delay.as_secs()
                    );
                }
                delay
            }
        };

        tokio::select! {
            _ = engine.shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    pool.set_outbound(None);
    debug!(pool = %pool.url, "Stratum client for pool {} stopped", pool.pool_no());
}

/// One connection from connect to disconnect. Returns Ok only on shutdown.
async fn run_connection(engine: &Arc<Engine>, pool: &Arc<Pool>, writer: &SharedWriter) -> StratumResult<()> {
    let (reader, w) = tokio::time::timeout(CONNECT_TIMEOUT, connection::connect(pool.name()))
        .await
        .map_err(|_| StratumError::Timeout(CONNECT_TIMEOUT))??;
    *writer.lock().await = Some(w);

    let mut client = Client {
        engine: engine.clone(),
        pool: pool.clone(),
        reader,
        writer: writer.clone(),
        control_ids: HashSet::new(),
    };
    client.handshake().await?;
    pool.set_stratum_active(true);
    info!(pool = %pool.url, "Stratum connection to pool {} established", pool.pool_no());
    // A job may have arrived while the handshake was still running.
    if pool.stratum_notify() {
        engine.pool_resus(pool);
    }
    client.run().await
}

/// Tear down after a disconnect: in-flight shares are lost and count as
/// stale, staged work from the pool is dropped, and the pool is marked dead.
async fn teardown(engine: &Engine, pool: &Arc<Pool>, writer: &SharedWriter) {
    *writer.lock().await = None;
    pool.set_stratum_active(false);

    let lost: Vec<InflightShare> = pool.inflight.lock().drain().map(|(_, s)| s).collect();
    if !lost.is_empty() {
        warn!(pool = %pool.url, lost = lost.len(), "Discarding in-flight shares for pool {}", pool.pool_no());
        for share in &lost {
            submit::count_stale(engine, &share.work);
        }
    }
    engine.clear_pool_work(pool);
    if !engine.shutdown.is_cancelled() {
        engine.pool_died(pool);
    }
}

struct Client {
    engine: Arc<Engine>,
    pool: Arc<Pool>,
    reader: MessageReader,
    writer: SharedWriter,

    /// Requests whose answers are not share results.
    control_ids: HashSet<u64>,
}

impl Client {
    async fn send(&mut self, method: &str, params: Value) -> StratumResult<u64> {
        let id = self.pool.next_submit_id();
        let msg = JsonRpcMessage::request(id, method, params);
        let mut writer = self.writer.lock().await;
        writer
            .as_mut()
            .ok_or(StratumError::Disconnected)?
            .write_message(&msg)
            .await?;
        Ok(id)
    }

    /// Send a request and wait for its answer, handling anything else the
    /// pool sends meanwhile.
    async fn request(&mut self, method: &str, params: Value) -> StratumResult<(Value, Value)> {
        let id = self.send(method, params).await?;
        let deadline = Instant::now() + REQUEST_TIMEOUT;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.reader.read_message())
                .await
                .map_err(|_| StratumError::Timeout(REQUEST_TIMEOUT))??
                .ok_or(StratumError::Disconnected)?;
            match msg {
                JsonRpcMessage::Response {
                    id: Some(rid),
                    result,
                    error,
                } if rid == id => return Ok((result, error)),
                other => self.handle_message(other).await?,
            }
        }
    }

    async fn handshake(&mut self) -> StratumResult<()> {
        let pool = self.pool.clone();
        let resume = pool
            .session
            .read()
            .stratum
            .as_ref()
            .and_then(|s| s.subscription_id.clone());

        let mut params = vec![json!(USER_AGENT)];
        if let Some(id) = &resume {
            params.push(json!(id));
        }
        let (mut result, mut error) = self.request("mining.subscribe", Value::Array(params)).await?;
        if !error.is_null() && resume.is_some() {
            debug!(pool = %pool.url, "Pool {} refused session resume", pool.pool_no());
            (result, error) = self.request("mining.subscribe", json!([USER_AGENT])).await?;
        }
        if !error.is_null() {
            return Err(StratumError::SubscriptionFailed(error.to_string()));
        }
        let sub = Subscription::from_result(&result)?;

        let resumed = {
            let mut session = pool.session.write();
            let previous = session.stratum.take();
            let resumed = previous.as_ref().is_some_and(|p| p.nonce1 == sub.nonce1);
            let sdiff = previous
                .as_ref()
                .filter(|_| resumed)
                .map_or(1.0, |p| p.sdiff);
            session.stratum = Some(StratumSession {
                nonce1: sub.nonce1.clone(),
                n2size: sub.n2size,
                sdiff,
                version_mask: None,
                subscription_id: sub.subscription_id.or(resume),
                job: None,
            });
            resumed
        };
        pool.set_stratum_notify(false);
        info!(
            pool = %pool.url,
            nonce1 = %sub.nonce1,
            n2size = sub.n2size,
            resumed,
            "Subscribed to pool {}",
            pool.pool_no()
        );

        let (result, error) = self
            .request("mining.authorize", json!([pool.user, pool.pass]))
            .await?;
        if result.as_bool() != Some(true) {
            let reason = reject_reason(&result, &error).unwrap_or_else(|| "refused".to_string());
            return Err(StratumError::AuthorizationFailed(reason));
        }
        info!(pool = %pool.url, user = %pool.user, "Stratum authorisation success for pool {}", pool.pool_no());

        if let Some(diff) = self.engine.config.suggested_difficulty {
            let id = self.send("mining.suggest_difficulty", json!([diff])).await?;
            self.control_ids.insert(id);
        }
        Ok(())
    }

    /// Receive loop. Returns Ok only on shutdown.
    async fn run(&mut self) -> StratumResult<()> {
        loop {
            let msg = tokio::select! {
                _ = self.engine.shutdown.cancelled() => return Ok(()),
                msg = tokio::time::timeout(READ_TIMEOUT, self.reader.read_message()) => msg,
            };
            let msg = msg
                .map_err(|_| StratumError::Timeout(READ_TIMEOUT))??
                .ok_or(StratumError::Disconnected)?;
            self.handle_message(msg).await?;
        }
    }

    async fn handle_message(&mut self, msg: JsonRpcMessage) -> StratumResult<()> {
        match msg {
            JsonRpcMessage::Request { id, method, params } => match method.as_str() {
                "mining.notify" => {
                    // A bad job only loses that update; the previous job stays.
                    if let Err(e) = self.on_notify(&params) {
                        self.pool.stats.lock().bad_messages += 1;
                        warn!(pool = %self.pool.url, error = %e, "Pool {} sent an unusable job", self.pool.pool_no());
                    }
                    Ok(())
                }
                "mining.set_difficulty" => {
                    self.on_set_difficulty(&params);
                    Ok(())
                }
                "mining.set_version_mask" => {
                    let mask = params
                        .get(0)
                        .and_then(Value::as_str)
                        .and_then(|s| u32::from_str_radix(s, 16).ok());
                    if let Some(live) = self.pool.session.write().stratum.as_mut() {
                        live.version_mask = mask;
                    }
                    debug!(pool = %self.pool.url, mask = ?mask, "Version mask set");
                    Ok(())
                }
                "client.reconnect" => Err(StratumError::ReconnectRequested),
                "client.show_message" => {
                    let text = params.get(0).and_then(Value::as_str).unwrap_or_default();
                    info!(pool = %self.pool.url, "Pool {} message: {}", self.pool.pool_no(), text);
                    Ok(())
                }
                "client.get_version" => {
                    let reply = JsonRpcMessage::response(id, json!(USER_AGENT));
                    if let Some(writer) = self.writer.lock().await.as_mut() {
                        writer.write_message(&reply).await?;
                    }
                    Ok(())
                }
                other => {
                    debug!(pool = %self.pool.url, method = other, "Ignoring unknown stratum method");
                    Ok(())
                }
            },
            JsonRpcMessage::Response { id, result, error } => {
                self.on_response(id, &result, &error);
                Ok(())
            }
        }
    }

    fn on_notify(&mut self, params: &Value) -> StratumResult<()> {
        let engine = &self.engine;
        let pool = &self.pool;
        let notify = JobNotification::from_stratum_params(params)?;
        let clean = notify.clean_jobs;
        let job_id = notify.job_id.clone();

        {
            let mut session = pool.session.write();
            let live = session
                .stratum
                .as_mut()
                .ok_or_else(|| StratumError::InvalidMessage("mining.notify before subscribe".into()))?;
            let job = build_job(notify, &live.nonce1, live.n2size)
                .map_err(|e| StratumError::InvalidMessage(e.to_string()))?;
            live.job = Some(job);
        }
        let first = !pool.stratum_notify();
        pool.set_stratum_notify(true);
        debug!(pool = %pool.url, job_id = %job_id, clean, "Stratum job from pool {}", pool.pool_no());

        if first && pool.stratum_active() && pool.is_idle() {
            engine.pool_resus(pool);
        }
        if clean {
            // Built only to run block-change detection, never staged.
            match gen_stratum_work(engine, pool) {
                Ok(mut work) => {
                    work.flags.insert(WorkFlags::LONGPOLL);
                    work.work_block = engine.blocks.work_block();
                    engine.test_work_current(&mut work);
                }
                Err(e) => warn!(pool = %pool.url, error = %e, "Failed to test clean stratum job"),
            }
        }
        if engine.registry.is_current(pool) {
            engine.signal_work_update();
        }
        engine.staging.wake_scheduler();
        Ok(())
    }

    fn on_set_difficulty(&mut self, params: &Value) {
        let Some(diff) = params.get(0).and_then(Value::as_f64).filter(|d| *d > 0.0) else {
            debug!(pool = %self.pool.url, params = %params, "Ignoring bad set_difficulty");
            return;
        };
        let previous = match self.pool.session.write().stratum.as_mut() {
            Some(live) => std::mem::replace(&mut live.sdiff, diff),
            None => return,
        };
        if previous != diff {
            info!(pool = %self.pool.url, diff, "Pool {} difficulty changed", self.pool.pool_no());
        }
    }

    fn on_response(&mut self, id: Option<u64>, result: &Value, error: &Value) {
        let Some(id) = id else {
            debug!(pool = %self.pool.url, error = %error, "Response without id");
            return;
        };
        if self.control_ids.remove(&id) {
            trace!(pool = %self.pool.url, id, result = %result, "Control response");
            return;
        }

        let outcome = if result.as_bool() == Some(true) && error.is_null() {
            ShareOutcome::Accepted
        } else {
            ShareOutcome::rejected(reject_reason(result, error))
        };
        let share = self.pool.inflight.lock().remove(&id);
        match share {
            Some(share) => {
                trace!(
                    pool = %self.pool.url,
                    id,
                    latency_ms = share.sent.elapsed().as_millis() as u64,
                    "Share response"
                );
                submit::share_result(&self.engine, &share.work, &outcome);
            }
            None => submit::untracked_result(&self.engine, &self.pool, &outcome),
        }
    }
}

/// Write queued shares to whichever connection is live.
async fn send_loop(
    engine: Arc<Engine>,
    pool: Arc<Pool>,
    mut rx: mpsc::UnboundedReceiver<Work>,
    writer: SharedWriter,
) {
    let mut last: Option<(u32, u64)> = None;
    loop {
        let work = tokio::select! {
            _ = engine.shutdown.cancelled() => break,
            work = rx.recv() => match work {
                Some(work) => work,
                None => break,
            },
        };
        let Some(stratum) = work.stratum.clone() else {
            warn!(pool = %pool.url, work_id = work.id, "Non-stratum work on stratum queue");
            continue;
        };

        let key = (work.nonce(), stratum.nonce2);
        if last == Some(key) {
            debug!(pool = %pool.url, work_id = work.id, "Filtering duplicate share");
            continue;
        }
        last = Some(key);
        send_share(&engine, &pool, &writer, work, &stratum).await;
    }
}

async fn send_share(
    engine: &Engine,
    pool: &Arc<Pool>,
    writer: &SharedWriter,
    mut work: Work,
    stratum: &StratumFields,
) {
    let submitted = Instant::now();
    let params = SubmitParams {
        username: pool.user.clone(),
        job_id: stratum.job_id.clone(),
        extranonce2: stratum.nonce2.to_le_bytes()[..stratum.nonce2_len.min(8)].to_vec(),
        ntime: stratum.ntime.clone(),
        nonce: work.nonce(),
        version_bits: None,
    }
    .to_stratum_json();

    loop {
        if pool.stratum_nonce1().as_deref() != Some(stratum.nonce1.as_str()) {
            info!(pool = %pool.url, work_id = work.id, "Stratum session changed, discarding share for pool {}", pool.pool_no());
            submit::count_stale(engine, &work);
            return;
        }

        if pool.stratum_active() {
            let mut guard = writer.lock().await;
            if let Some(w) = guard.as_mut() {
                let id = pool.next_submit_id();
                let msg = JsonRpcMessage::request(id, "mining.submit", params.clone());
                let work_id = work.id;
                pool.inflight.lock().insert(
                    id,
                    InflightShare {
                        id,
                        work,
                        submitted,
                        sent: Instant::now(),
                    },
                );
                match w.write_message(&msg).await {
                    Ok(()) => {
                        trace!(pool = %pool.url, id, work_id, "Share sent");
                        return;
                    }
                    Err(e) => {
                        warn!(pool = %pool.url, error = %e, "Failed to send share to pool {}", pool.pool_no());
                        // A teardown may have claimed it already.
                        match pool.inflight.lock().remove(&id) {
                            Some(share) => work = share.work,
                            None => return,
                        }
                    }
                }
            }
        }

        if submitted.elapsed() >= RESUBMIT_WINDOW {
            warn!(
                pool = %pool.url,
                work_id = work.id,
                "Share unsent for {}s, discarding",
                RESUBMIT_WINDOW.as_secs()
            );
            submit::count_stale(engine, &work);
            return;
        }
        tokio::select! {
            _ = engine.shutdown.cancelled() => return,
            _ = tokio::time::sleep(RESUBMIT_INTERVAL) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    use crate::engine::test_util::config;

    /// The pool side of a test connection.
    struct FakePool {
        listener: TcpListener,
    }

    struct Peer {
        rx: MessageReader,
        tx: MessageWriter,
    }

    impl FakePool {
        async fn start() -> (FakePool, Arc<Engine>) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let mut config = config(1);
            config.pools[0].url = format!("stratum+tcp://{}", listener.local_addr().unwrap());
            let engine = Engine::new(config).unwrap();
            let pool = engine.registry.current();
            tokio::spawn(stratum_task(engine.clone(), pool));
            (FakePool { listener }, engine)
        }

        async fn accept(&self) -> Peer {
            let (socket, _) = self.listener.accept().await.unwrap();
            let (rx, tx) = connection::split(socket);
            Peer { rx, tx }
        }
    }

    impl Peer {
        async fn expect(&mut self, method: &str) -> (Option<u64>, Value) {
            match self.rx.read_message().await.unwrap().unwrap() {
                JsonRpcMessage::Request { id, method: m, params } => {
                    assert_eq!(m, method);
                    (id, params)
                }
                other => panic!("expected {method}, got {other:?}"),
            }
        }

        async fn reply(&mut self, id: Option<u64>, result: Value) {
            self.tx.write_message(&JsonRpcMessage::response(id, result)).await.unwrap();
        }

        async fn notify(&mut self, method: &str, params: Value) {
            let msg = JsonRpcMessage::Request {
                id: None,
                method: method.into(),
                params,
            };
            self.tx.write_message(&msg).await.unwrap();
        }

        /// Subscribe, authorize, then hand out a difficulty and a clean job.
        async fn handshake(&mut self) {
            let (id, params) = self.expect("mining.subscribe").await;
            assert_eq!(params[0], USER_AGENT);
            self.reply(id, json!([[["mining.notify", "sub1"]], "0102", 4])).await;
            let (id, params) = self.expect("mining.authorize").await;
            assert_eq!(params, json!(["worker", "x"]));
            self.reply(id, json!(true)).await;
            self.notify("mining.set_difficulty", json!([16])).await;
            self.notify(
                "mining.notify",
                json!([
                    "job1",
                    "00".repeat(31) + "01",
                    "01000000",
                    "ffffffff",
                    [],
                    "20000000",
                    "1d00ffff",
                    "65000000",
                    true
                ]),
            )
            .await;
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met");
    }

    #[tokio::test]
    async fn test_handshake_installs_session_and_job() {
        let (fake, engine) = FakePool::start().await;
        let pool = engine.registry.current();
        let mut peer = fake.accept().await;
        peer.handshake().await;

        wait_until(|| pool.stratum_ready()).await;
        {
            let session = pool.session.read();
            let live = session.stratum.as_ref().unwrap();
            assert_eq!(live.nonce1, "0102");
            assert_eq!(live.n2size, 4);
            assert_eq!(live.sdiff, 16.0);
            assert_eq!(live.subscription_id.as_deref(), Some("sub1"));
            assert_eq!(live.job.as_ref().unwrap().job_id, "job1");
        }
        assert!(pool.has_stratum());
        // The clean job went through block-change detection.
        assert!(engine.blocks.current().is_some());

        let work = gen_stratum_work(&engine, &pool).unwrap();
        assert!((work.difficulty - 16.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_shares_results_and_duplicate_filter() {
        let (fake, engine) = FakePool::start().await;
        let pool = engine.registry.current();
        let mut peer = fake.accept().await;
        peer.handshake().await;
        wait_until(|| pool.stratum_ready()).await;

        let mut work = gen_stratum_work(&engine, &pool).unwrap();
        work.set_nonce(0x1234_5678);
        let mut other = work.clone();
        other.set_nonce(0x0bad_cafe);
        pool.queue_share(work.clone()).unwrap();
        pool.queue_share(work).unwrap();
        pool.queue_share(other).unwrap();

        let (id, params) = peer.expect("mining.submit").await;
        assert_eq!(params[0], "worker");
        assert_eq!(params[1], "job1");
        assert_eq!(params[4], "12345678");
        peer.reply(id, json!(true)).await;

        // The duplicate never reaches the pool.
        let (id, params) = peer.expect("mining.submit").await;
        assert_eq!(params[4], "0badcafe");
        let rejected = JsonRpcMessage::Response {
            id,
            result: Value::Null,
            error: json!([23, "low difficulty share", null]),
        };
        peer.tx.write_message(&rejected).await.unwrap();

        // An answer for a share we no longer track still counts.
        peer.reply(Some(999), json!(true)).await;

        wait_until(|| {
            let stats = pool.stats.lock();
            stats.accepted == 2 && stats.rejected == 1
        })
        .await;
        assert!(pool.inflight.lock().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_counts_inflight_stale() {
        let (fake, engine) = FakePool::start().await;
        let pool = engine.registry.current();
        let mut peer = fake.accept().await;
        peer.handshake().await;
        wait_until(|| pool.stratum_ready()).await;

        let mut work = gen_stratum_work(&engine, &pool).unwrap();
        work.set_nonce(1);
        pool.queue_share(work).unwrap();
        peer.expect("mining.submit").await;
        drop(peer);

        wait_until(|| !pool.stratum_active()).await;
        wait_until(|| pool.stats.lock().stale == 1).await;
        assert!(pool.inflight.lock().is_empty());
        assert!(pool.is_idle());
    }

    #[tokio::test]
    async fn test_malformed_notify_keeps_session() {
        let (fake, engine) = FakePool::start().await;
        let pool = engine.registry.current();
        let mut peer = fake.accept().await;
        peer.handshake().await;
        wait_until(|| pool.stratum_ready()).await;

        peer.notify("mining.notify", json!(["job2", "zz"])).await;
        wait_until(|| pool.stats.lock().bad_messages == 1).await;

        // The connection still answers, and the previous job is kept.
        peer.notify("client.show_message", json!(["still here"])).await;
        let msg = JsonRpcMessage::Request {
            id: Some(8),
            method: "client.get_version".into(),
            params: json!([]),
        };
        peer.tx.write_message(&msg).await.unwrap();
        match peer.rx.read_message().await.unwrap().unwrap() {
            JsonRpcMessage::Response { id, .. } => assert_eq!(id, Some(8)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(pool.stratum_active());
        assert!(!pool.is_idle());
        let session = pool.session.read();
        assert_eq!(session.stratum.as_ref().unwrap().job.as_ref().unwrap().job_id, "job1");
    }

    #[tokio::test]
    async fn test_get_version_and_show_message() {
        let (fake, engine) = FakePool::start().await;
        let pool = engine.registry.current();
        let mut peer = fake.accept().await;
        peer.handshake().await;
        wait_until(|| pool.stratum_ready()).await;

        peer.notify("client.show_message", json!(["hello"])).await;
        let msg = JsonRpcMessage::Request {
            id: Some(7),
            method: "client.get_version".into(),
            params: json!([]),
        };
        peer.tx.write_message(&msg).await.unwrap();
        match peer.rx.read_message().await.unwrap().unwrap() {
            JsonRpcMessage::Response { id, result, .. } => {
                assert_eq!(id, Some(7));
                assert_eq!(result, USER_AGENT);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
