//! Simulation controller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, ensure, Context};
use cashbridge_common::{
    CashBridgeError, Clock, Currency, EscrowId, EscrowRecord, LedgerAddress, ManualClock, PartyId,
    Satoshis, TxRef,
};
use cashbridge_coordinator::{
    CoordinatorConfig, EscrowCoordinator, InMemoryDirectory, LoggingNotifier, RecordStore,
    SweepScheduler,
};
use cashbridge_fees::{ConversionRequest, Direction, FeeEngine, FeeSchedule, Location, Urgency};
use cashbridge_fx::{AggregatedRateProvider, FxEngine, FxEngineConfig, StaticRateProvider};
use cashbridge_ledger::{Fault, InMemoryInstantChannel, InMemoryLedger};
use cashbridge_routing::{
    RoutingConfig, RoutingDecider, TransferRecord, TransferRequest, TransferStatus, TransferUrgency,
};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};

use crate::agents::{AgentFactory, SimulatedAgent};
use crate::metrics::SimulationMetrics;
use crate::scenario::{AssertCondition, FaultKind, FaultTarget, Scenario, ScenarioStep};

const SIM_WALLET: &str = "sim-wallet";
const PEER_WALLET: &str = "peer-wallet";

/// Wires every component against in-memory collaborators and drives them.
pub struct SimulationController {
    speed: f64,
    rng: StdRng,
    agents: Vec<SimulatedAgent>,
    ledger: Arc<InMemoryLedger>,
    channel: Arc<InMemoryInstantChannel>,
    directory: Arc<InMemoryDirectory>,
    clock: Arc<ManualClock>,
    coordinator: Arc<EscrowCoordinator>,
    fees: FeeEngine,
    fx: Arc<FxEngine>,
    router: RoutingDecider,
    escrows: HashMap<String, EscrowId>,
    last_transfer: Option<TransferRecord>,
    metrics: SimulationMetrics,
}

impl SimulationController {
    pub fn new(
        agent_count: usize,
        speed: f64,
        seed: Option<u64>,
        store: Arc<dyn RecordStore>,
        coordinator_config: CoordinatorConfig,
        routing_config: RoutingConfig,
    ) -> anyhow::Result<Self> {
        ensure!(agent_count > 0, "need at least one agent");
        ensure!(speed > 0.0, "speed must be positive");

        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        let ledger = Arc::new(InMemoryLedger::new());
        let channel = Arc::new(InMemoryInstantChannel::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));

        let agents = AgentFactory::create_agents(agent_count);
        for agent in &agents {
            directory.add_agent(agent.agent.clone());
            info!(agent = %agent.id(), name = %agent.name, "Agent registered");
        }

        // Two desks quoting slightly different prices
        let desk_a = StaticRateProvider::new("desk-a")
            .with_usd_rate(Currency::btc(), dec!(60000))
            .with_usd_rate(Currency::kes(), dec!(0.0077))
            .with_usd_rate(Currency::ngn(), dec!(0.00065))
            .with_usd_rate(Currency::ugx(), dec!(0.00027));
        let desk_b = StaticRateProvider::new("desk-b")
            .with_usd_rate(Currency::btc(), dec!(60100))
            .with_usd_rate(Currency::kes(), dec!(0.0077))
            .with_usd_rate(Currency::ngn(), dec!(0.00065))
            .with_usd_rate(Currency::ugx(), dec!(0.00027));
        let provider = AggregatedRateProvider::new(vec![Arc::new(desk_a), Arc::new(desk_b)]);
        let fx = Arc::new(FxEngine::new(Arc::new(provider), FxEngineConfig::default()));

        let coordinator = EscrowCoordinator::new(
            coordinator_config,
            ledger.clone(),
            store,
            Arc::new(LoggingNotifier),
            directory.clone(),
        )
        .with_clock(clock.clone());

        let router = RoutingDecider::new(fx.clone(), ledger.clone(), channel.clone(), routing_config)?;

        ledger.deposit(&LedgerAddress::new(SIM_WALLET), Satoshis::new(100_000_000));

        Ok(Self {
            speed,
            rng,
            agents,
            ledger,
            channel,
            directory,
            clock,
            coordinator: Arc::new(coordinator),
            fees: FeeEngine::new(FeeSchedule::from_env())?,
            fx,
            router,
            escrows: HashMap::new(),
            last_transfer: None,
            metrics: SimulationMetrics::new(),
        })
    }

    /// Run a scenario, failing on the first broken assertion.
    pub async fn run_scenario(&mut self, scenario: &Scenario) -> anyhow::Result<()> {
        info!(scenario = %scenario.name, "{}", scenario.description);

        for (n, step) in scenario.steps.iter().enumerate() {
            self.execute_step(step)
                .await
                .with_context(|| format!("{} step {}", scenario.name, n + 1))?;
        }

        info!(scenario = %scenario.name, "Scenario passed");
        Ok(())
    }

    /// Generate random exchanges until `duration` elapses or Ctrl+C.
    pub async fn run(&mut self, duration: Option<Duration>) -> anyhow::Result<()> {
        info!("Running simulation in continuous mode");

        let scheduler = SweepScheduler::new(
            self.coordinator.clone(),
            self.clock.clone(),
            self.coordinator.config().sweep_interval,
        )
        .spawn();

        let deadline = async {
            match duration {
                Some(d) => tokio::time::sleep(d).await,
                None => {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!(error = %e, "Could not listen for Ctrl+C");
                        std::future::pending::<()>().await;
                    }
                }
            }
        };
        tokio::pin!(deadline);

        let delay = Duration::from_millis((1000.0 / self.speed) as u64);
        loop {
            let result = tokio::select! {
                _ = &mut deadline => break,
                result = self.random_exchange() => result,
            };
            if let Err(e) = result {
                warn!(error = %e, "Simulated exchange failed");
                self.metrics.record_failure();
            }

            // Each tick is ninety simulated minutes
            self.clock.advance(chrono::Duration::minutes(90));
            tokio::time::sleep(delay).await;
        }

        let sweeps = scheduler.stop().await;
        info!(sweeps, "Continuous mode finished");
        Ok(())
    }

    pub fn metrics(&self) -> &SimulationMetrics {
        &self.metrics
    }

    pub fn coordinator(&self) -> &EscrowCoordinator {
        &self.coordinator
    }

    async fn random_exchange(&mut self) -> anyhow::Result<()> {
        let agent = self.rng.gen_range(0..self.agents.len());
        let requester = format!("requester_{}", self.rng.gen_range(1..=20));
        let amount = Decimal::from(self.rng.gen_range(500..20_000));
        let near = self.agents[agent].location;
        let location = Location::new(
            near.lat + self.rng.gen_range(-0.05..0.05),
            near.lng + self.rng.gen_range(-0.05..0.05),
            near.accessibility,
        );
        let label = format!("random-{}", self.metrics.escrows_opened + 1);

        self.open_escrow(&label, &requester, agent, amount, Currency::kes(), Urgency::Standard, location)
            .await?;

        // Most exchanges complete; some requesters never show, some agents never show
        let roll = self.rng.gen_range(0..100);
        if roll < 85 {
            self.fund(&label).await?;
        }
        if roll < 70 {
            self.verify(&label).await?;
        }
        Ok(())
    }

    async fn execute_step(&mut self, step: &ScenarioStep) -> anyhow::Result<()> {
        match step {
            ScenarioStep::OpenEscrow {
                label,
                requester,
                agent,
                amount,
                currency,
                urgency,
                location,
            } => {
                let amount = Decimal::from_str_exact(amount)
                    .with_context(|| format!("bad amount {amount}"))?;
                self.open_escrow(label, requester, *agent, amount, Currency::new(currency.as_str()), *urgency, *location)
                    .await?;
            }
            ScenarioStep::Fund { label } => self.fund(label).await?,
            ScenarioStep::Verify { label } => self.verify(label).await?,
            ScenarioStep::VerifyConcurrently { label, attempts } => {
                self.verify_concurrently(label, *attempts).await?
            }
            ScenarioStep::AdvanceClock { hours } => {
                self.clock.advance(chrono::Duration::hours(*hours));
                info!(now = %self.clock.now(), "Clock advanced");
            }
            ScenarioStep::Sweep => {
                let report = self.coordinator.sweep_expired(self.clock.now()).await?;
                info!(?report, "Sweep ran");
                self.metrics.record_sweep(&report);
            }
            ScenarioStep::InjectFault { target, kind } => {
                let fault = match kind {
                    FaultKind::Fail => Fault::Fail,
                    FaultKind::Hang => Fault::Hang,
                };
                info!(?target, ?kind, "Injecting fault");
                self.set_fault(*target, fault);
            }
            ScenarioStep::ClearFaults => {
                for target in [
                    FaultTarget::LedgerSend,
                    FaultTarget::LedgerBalance,
                    FaultTarget::LedgerAddress,
                    FaultTarget::InstantChannel,
                ] {
                    self.set_fault(target, Fault::None);
                }
                info!("Faults cleared");
            }
            ScenarioStep::Transfer { sats, with_invoice } => {
                self.transfer(Satoshis::new(*sats), *with_invoice).await?
            }
            ScenarioStep::Assert { condition } => self.check(condition).await?,
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn open_escrow(
        &mut self,
        label: &str,
        requester: &str,
        agent: usize,
        amount: Decimal,
        currency: Currency,
        urgency: Urgency,
        location: Location,
    ) -> anyhow::Result<EscrowRecord> {
        let agent = self
            .agents
            .get(agent)
            .ok_or_else(|| anyhow!("no agent number {agent}"))?;
        let now = self.clock.now();

        let request = ConversionRequest {
            amount,
            currency: currency.clone(),
            direction: Direction::BitcoinToCash,
            location,
            urgency,
            timestamp: now,
        };
        let breakdown = self
            .fees
            .compute_fee_for_provider(&request, &agent.location, &now)?;

        let btc = self.fx.convert(&request.gross(), Currency::btc()).await?;
        let sats = Satoshis::from_btc(btc.value)
            .ok_or_else(|| anyhow!("cannot express {} in satoshis", btc))?;

        let requester = PartyId::new(requester);
        self.directory.set_payout_address(
            requester.clone(),
            LedgerAddress::new(format!("{requester}-wallet")),
        );

        let record = self
            .coordinator
            .create_escrow(
                requester,
                agent.id().clone(),
                sats,
                breakdown.net_local_amount().value,
                currency,
            )
            .await?;

        info!(
            label,
            agent = %agent.name,
            distance_km = %format!("{:.1}", breakdown.distance_km),
            fee_pct = %breakdown.total_fee_percentage,
            fee = %breakdown.total_fee(),
            agent_share = %breakdown.agent_share,
            committed = %record.bitcoin_amount,
            "Exchange opened"
        );

        self.metrics.record_opened();
        self.escrows.insert(label.to_string(), record.id);
        Ok(record)
    }

    async fn fund(&mut self, label: &str) -> anyhow::Result<()> {
        let record = self.escrow(label).await?;
        self.ledger
            .deposit(&record.escrow_address, record.bitcoin_amount);

        let funded = self.coordinator.check_funding(record.id).await?;
        ensure!(funded, "escrow {label} not funded after full deposit");
        Ok(())
    }

    async fn verify(&mut self, label: &str) -> anyhow::Result<()> {
        let record = self.escrow(label).await?;
        let started = Instant::now();

        let result = self
            .coordinator
            .verify_and_complete(&record.agent_id, record.exchange_code.as_str())
            .await;
        self.record_release(label, result, started);
        Ok(())
    }

    async fn verify_concurrently(&mut self, label: &str, attempts: usize) -> anyhow::Result<()> {
        let record = self.escrow(label).await?;
        let started = Instant::now();

        let tasks = (0..attempts).map(|_| {
            let coordinator = self.coordinator.clone();
            let agent = record.agent_id.clone();
            let code = record.exchange_code.as_str().to_string();
            tokio::spawn(async move { coordinator.verify_and_complete(&agent, &code).await })
        });

        for joined in futures::future::join_all(tasks).await {
            self.record_release(label, joined?, started);
        }
        Ok(())
    }

    fn record_release(
        &mut self,
        label: &str,
        result: cashbridge_common::Result<EscrowRecord>,
        started: Instant,
    ) {
        match result {
            Ok(record) => {
                let latency = started.elapsed().as_millis() as u64;
                info!(label, settlement_ref = ?record.settlement_ref, latency_ms = latency, "Escrow released");
                self.metrics.record_completion(latency);
            }
            Err(e @ (CashBridgeError::Conflict { .. } | CashBridgeError::NotFunded { .. })) => {
                info!(label, error = %e, "Release lost the race");
                self.metrics.record_conflict();
            }
            Err(e) if e.requires_manual_review() => {
                warn!(label, error = %e, "Release escalated");
                self.metrics.record_dispute();
            }
            Err(e) => {
                warn!(label, error = %e, code = e.error_code(), "Release rejected");
                self.metrics.record_failure();
            }
        }
    }

    async fn transfer(&mut self, amount: Satoshis, with_invoice: bool) -> anyhow::Result<()> {
        let payment_request = if with_invoice {
            Some(
                self.router
                    .request_payment(amount, "simulated transfer")
                    .await?
                    .payment_request,
            )
        } else {
            None
        };

        let request = TransferRequest {
            source: LedgerAddress::new(SIM_WALLET),
            destination: LedgerAddress::new(PEER_WALLET),
            payment_request,
            amount,
            urgency: TransferUrgency::Standard,
            memo: None,
        };

        let mut record = self.router.execute_transfer(&request).await?;
        if record.status == TransferStatus::Processing {
            if let Some(tx_ref) = &record.channel_ref {
                // Mine it straight away
                self.ledger.confirm(&TxRef::new(tx_ref.clone()), 1);
                record = self.router.refresh_transfer(&record).await?;
            }
        }

        info!(
            amount = %amount,
            method = %record.method,
            status = ?record.status,
            fee = ?record.fee,
            "Transfer finished"
        );
        self.metrics.record_transfer(&record);
        self.last_transfer = Some(record);
        Ok(())
    }

    async fn check(&self, condition: &AssertCondition) -> anyhow::Result<()> {
        match condition {
            AssertCondition::EscrowStatus { label, status } => {
                let record = self.escrow(label).await?;
                ensure!(
                    record.status.as_str() == status,
                    "escrow {label} is {}, expected {status}",
                    record.status
                );
            }
            AssertCondition::AgentPaid { label } => {
                let record = self.escrow(label).await?;
                let wallet = self
                    .agents
                    .iter()
                    .find(|a| *a.id() == record.agent_id)
                    .map(|a| a.wallet().clone())
                    .ok_or_else(|| anyhow!("unknown agent {}", record.agent_id))?;
                ensure!(
                    self.ledger.balance_of(&wallet) >= record.bitcoin_amount,
                    "agent for {label} was not paid"
                );
            }
            AssertCondition::RequesterRefunded { label } => {
                let record = self.escrow(label).await?;
                let wallet = LedgerAddress::new(format!("{}-wallet", record.requester_id));
                ensure!(
                    self.ledger.balance_of(&wallet) >= record.bitcoin_amount,
                    "requester for {label} was not refunded"
                );
            }
            AssertCondition::LastTransferMethod { method } => {
                let Some(last) = &self.last_transfer else {
                    bail!("no transfer has run yet");
                };
                ensure!(
                    last.method.as_str() == method,
                    "last transfer went {}, expected {method}",
                    last.method
                );
            }
        }

        Ok(())
    }

    async fn escrow(&self, label: &str) -> anyhow::Result<EscrowRecord> {
        let id = self
            .escrows
            .get(label)
            .ok_or_else(|| anyhow!("no escrow labelled {label}"))?;
        Ok(self.coordinator.get_escrow(*id).await?)
    }

    fn set_fault(&self, target: FaultTarget, fault: Fault) {
        match target {
            FaultTarget::LedgerSend => self.ledger.set_send_fault(fault),
            FaultTarget::LedgerBalance => self.ledger.set_balance_fault(fault),
            FaultTarget::LedgerAddress => self.ledger.set_address_fault(fault),
            FaultTarget::InstantChannel => self.channel.set_fault(fault),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cashbridge_coordinator::InMemoryRecordStore;

    fn controller() -> SimulationController {
        let coordinator_config = CoordinatorConfig {
            ledger_timeout: Duration::from_millis(100),
            notification_timeout: Duration::from_millis(100),
            ..CoordinatorConfig::default()
        };
        let routing_config = RoutingConfig {
            channel_timeout: Duration::from_millis(100),
            ..RoutingConfig::default()
        };

        SimulationController::new(
            4,
            1.0,
            Some(7),
            Arc::new(InMemoryRecordStore::new()),
            coordinator_config,
            routing_config,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_every_scenario_passes() {
        for scenario in Scenario::all() {
            let mut controller = controller();
            controller.run_scenario(&scenario).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_concurrent_release_counts() {
        let mut controller = controller();
        controller
            .run_scenario(&Scenario::load("concurrent-release").unwrap())
            .await
            .unwrap();

        assert_eq!(controller.metrics().escrows_completed, 1);
        assert_eq!(controller.metrics().conflicts, 4);
        assert_eq!(controller.coordinator().metrics().snapshot().escrows_completed, 1);
    }

    #[tokio::test]
    async fn test_failed_assertion_is_reported() {
        let mut controller = controller();
        let scenario = Scenario {
            name: "broken".to_string(),
            description: "asserts on a missing escrow".to_string(),
            steps: vec![ScenarioStep::Assert {
                condition: AssertCondition::EscrowStatus {
                    label: "ghost".to_string(),
                    status: "completed".to_string(),
                },
            }],
        };

        let err = controller.run_scenario(&scenario).await.unwrap_err();
        assert!(format!("{err:#}").contains("ghost"));
    }

    #[tokio::test]
    async fn test_continuous_mode_runs() {
        let mut controller = SimulationController::new(
            3,
            100.0,
            Some(1),
            Arc::new(InMemoryRecordStore::new()),
            CoordinatorConfig::default(),
            RoutingConfig::default(),
        )
        .unwrap();

        controller.run(Some(Duration::from_millis(200))).await.unwrap();
        assert!(controller.metrics().escrows_opened > 0);
    }
}
