//! End-to-end slot processing against a scripted radio: frames staged by
//! the MAC are captured at the arm boundary and slot outcomes are injected
//! as if the radio IRQ had fired.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use uwblink::{
    auto_timeslot, ArqSettings, CcaCfg, CcaFailAction, ChannelCfg, ConnectionCfg, ConnectionId,
    Error, Event, FrameOutcome, MemPool, NodeCfg, PhyStep, Role, SlaveSyncState, SleepLevel,
    SlotDir, SlotIntent, SlotOutcome, StackCfg, Transceiver, Wps, WpsHal,
};

// ---- mocks ---------------------------------------------------------------

struct MockHal {
    tick: Rc<Cell<u64>>,
    context_switches: Rc<Cell<u32>>,
}

impl WpsHal for MockHal {
    fn enable_radio_irq(&mut self) {}
    fn disable_radio_irq(&mut self) {}
    fn enable_radio_dma_irq(&mut self) {}
    fn disable_radio_dma_irq(&mut self) {}
    fn context_switch(&mut self) {
        self.context_switches.set(self.context_switches.get() + 1);
    }
    fn tick_quarter_ms(&self) -> u64 {
        self.tick.get()
    }
}

/// What the scripted radio reports for one slot.
#[derive(Clone, Default)]
struct SlotScript {
    main: SlotOutcome,
    main_rx_bytes: Vec<u8>,
    auto: Option<SlotOutcome>,
    auto_rx_bytes: Vec<u8>,
}

#[allow(dead_code)]
#[derive(Clone)]
struct ArmRecord {
    dir: SlotDir,
    frame: Vec<u8>,
    sleep_cycles: u32,
    rx_timeout: u32,
    expect_ack: bool,
    frequency: u16,
    tx_pulse_count: u8,
    has_auto: bool,
}

#[derive(Default)]
struct RadioState {
    arms: Vec<ArmRecord>,
    scripts: VecDeque<SlotScript>,
    current: Option<SlotScript>,
    register_writes: Vec<(u8, u8)>,
}

struct ScriptedRadio {
    state: Rc<RefCell<RadioState>>,
}

impl Transceiver for ScriptedRadio {
    type Error = ();

    fn power_up(&mut self) -> Result<(), ()> {
        Ok(())
    }

    fn park(&mut self) -> Result<(), ()> {
        Ok(())
    }

    fn resync_timer(&mut self) -> Result<(), ()> {
        Ok(())
    }

    fn arm(&mut self, main: &SlotIntent<'_>, auto_reply: Option<&SlotIntent<'_>>) -> Result<(), ()> {
        let mut state = self.state.borrow_mut();
        state.arms.push(ArmRecord {
            dir: main.dir,
            frame: main.frame.to_vec(),
            sleep_cycles: main.sleep_cycles,
            rx_timeout: main.rx_timeout,
            expect_ack: main.expect_ack,
            frequency: main.channel.frequency,
            tx_pulse_count: main.channel.tx_pulse_count,
            has_auto: auto_reply.is_some(),
        });
        let next = state.scripts.pop_front().unwrap_or_default();
        state.current = Some(next);
        Ok(())
    }

    fn service_irq(&mut self) -> Result<PhyStep, ()> {
        if self.state.borrow().current.is_some() {
            Ok(PhyStep::SlotDone)
        } else {
            Ok(PhyStep::Pending)
        }
    }

    fn service_transfer(&mut self) -> Result<PhyStep, ()> {
        self.service_irq()
    }

    fn main_outcome(&mut self) -> SlotOutcome {
        self.state
            .borrow()
            .current
            .as_ref()
            .map(|c| c.main)
            .unwrap_or_default()
    }

    fn auto_outcome(&mut self) -> Option<SlotOutcome> {
        self.state.borrow().current.as_ref().and_then(|c| c.auto)
    }

    fn read_frame(&mut self, buf: &mut [u8]) -> usize {
        let state = self.state.borrow();
        let Some(current) = state.current.as_ref() else {
            return 0;
        };
        let len = current.main_rx_bytes.len().min(buf.len());
        buf[..len].copy_from_slice(&current.main_rx_bytes[..len]);
        len
    }

    fn read_auto_frame(&mut self, buf: &mut [u8]) -> usize {
        let state = self.state.borrow();
        let Some(current) = state.current.as_ref() else {
            return 0;
        };
        let len = current.auto_rx_bytes.len().min(buf.len());
        buf[..len].copy_from_slice(&current.auto_rx_bytes[..len]);
        len
    }

    fn write_register(&mut self, reg: u8, data: u8) -> Result<(), ()> {
        self.state.borrow_mut().register_writes.push((reg, data));
        Ok(())
    }

    fn read_register(&mut self, _reg: u8) -> Result<u8, ()> {
        Ok(0x5a)
    }
}

// ---- harness -------------------------------------------------------------

const COORD_ADDR: u8 = 1;
const NODE_ADDR: u8 = 2;
const PAN_ID: u16 = 0x0abc;

struct Bench {
    wps: &'static mut Wps<'static, ScriptedRadio, MockHal>,
    conn: ConnectionId,
    radio: Rc<RefCell<RadioState>>,
    tick: Rc<Cell<u64>>,
}

struct BenchCfg {
    role: Role,
    tx_side: bool,
    queue_size: usize,
    arq_enabled: bool,
    arq: ArqSettings,
    auto_sync: bool,
    cca: Option<CcaCfg>,
    throttling: bool,
    fast_sync: bool,
}

impl Default for BenchCfg {
    fn default() -> Self {
        BenchCfg {
            role: Role::Coordinator,
            tx_side: true,
            queue_size: 2,
            arq_enabled: false,
            arq: ArqSettings::default(),
            auto_sync: true,
            cca: None,
            throttling: false,
            fast_sync: false,
        }
    }
}

fn build(cfg: BenchCfg) -> Bench {
    let region = Box::leak(vec![0u8; 64 * 1024].into_boxed_slice());
    let pool: &'static mut MemPool<'static> = Box::leak(Box::new(MemPool::new(region)));

    let tick = Rc::new(Cell::new(0u64));
    let hal = MockHal {
        tick: tick.clone(),
        context_switches: Rc::new(Cell::new(0)),
    };

    let stack_cfg = StackCfg {
        timeslot_duration_us: &[1000],
        channel_sequence: &[0],
        random_channel_sequence_enabled: false,
        fast_sync_enabled: cfg.fast_sync,
        rdo_rollover: None,
    };
    let mut wps = Wps::init(stack_cfg, hal, pool).unwrap();

    let local = if cfg.tx_side { COORD_ADDR } else { NODE_ADDR };
    wps.node_init(NodeCfg {
        role: cfg.role,
        pan_id: PAN_ID,
        coordinator_address: COORD_ADDR,
        local_address: local,
        sleep_level: SleepLevel::Idle,
    })
    .unwrap();

    let radio = Rc::new(RefCell::new(RadioState::default()));
    wps.node_add_radio(ScriptedRadio {
        state: radio.clone(),
    })
    .unwrap();

    let conn = wps
        .connection_init(
            ConnectionCfg {
                source_address: COORD_ADDR,
                destination_address: NODE_ADDR,
                max_payload_size: 32,
                queue_size: cfg.queue_size,
                timeslot_ids: &[0],
                ack_enabled: true,
                arq_enabled: cfg.arq_enabled,
                arq_settings: cfg.arq,
                auto_sync_enabled: cfg.auto_sync,
                cca: cfg.cca,
                throttling_enabled: cfg.throttling,
                ..ConnectionCfg::default()
            },
            pool,
        )
        .unwrap();
    wps.connection_add_channel(
        conn,
        ChannelCfg {
            frequency: 7875,
            tx_pulse_count: 2,
            tx_pulse_width: 6,
            tx_pulse_gain: 0,
            rx_pulse_count: 2,
        },
    )
    .unwrap();
    wps.setup().unwrap();

    Bench {
        wps: Box::leak(Box::new(wps)),
        conn,
        radio,
        tick,
    }
}

fn counter() -> (&'static Cell<u32>, &'static dyn Fn()) {
    let hits: &'static Cell<u32> = Box::leak(Box::new(Cell::new(0)));
    let cb: &'static dyn Fn() = &*Box::leak(Box::new(move || hits.set(hits.get() + 1)));
    (hits, cb)
}

fn push_script(radio: &Rc<RefCell<RadioState>>, script: SlotScript) {
    radio.borrow_mut().scripts.push_back(script);
}

fn outcome(kind: FrameOutcome) -> SlotOutcome {
    SlotOutcome {
        outcome: kind,
        rssi_raw: 20,
        rnsi_raw: 40,
        rx_wait_time: 273,
        ..SlotOutcome::default()
    }
}

/// Control header of a main slot: timeslot id + SAW bit, then the hop
/// sequence index.
fn main_header(timeslot_id: u8, saw: bool, hop_index: u8) -> Vec<u8> {
    let byte0 = (timeslot_id & 0x7f) | if saw { 0x80 } else { 0 };
    vec![byte0, hop_index]
}

// ---- scenarios -----------------------------------------------------------

#[test]
fn basic_send_is_acknowledged() {
    let bench = build(BenchCfg {
        arq_enabled: true,
        ..BenchCfg::default()
    });
    let (tx_hits, tx_cb) = counter();
    bench.wps.set_tx_success_callback(bench.conn, tx_cb);

    let payload: Vec<u8> = (0..16).collect();
    bench.wps.send(bench.conn, &payload).unwrap();

    assert!(!bench.wps.connection(bench.conn).arq().seq_num());

    push_script(&bench.radio, SlotScript {
        main: outcome(FrameOutcome::SentAck),
        ..SlotScript::default()
    });
    bench.wps.connect().unwrap();

    // connect() armed slot 0 with the queued frame.
    {
        let state = bench.radio.borrow();
        let arm = state.arms.last().unwrap();
        assert_eq!(arm.dir, SlotDir::Tx);
        assert!(arm.expect_ack);
        assert_eq!(arm.frequency, 7875);
        // Two header bytes (slot id 0, SAW 0, hop index 0) then payload.
        assert_eq!(&arm.frame[..2], &[0x00, 0x00]);
        assert_eq!(&arm.frame[2..], payload.as_slice());
    }

    bench.wps.radio_irq();
    bench.wps.process_callbacks();

    assert_eq!(tx_hits.get(), 1);
    let stats = *bench.wps.connection(bench.conn).stats();
    assert_eq!(stats.tx_success, 1);
    assert_eq!(stats.tx_byte_sent, 16);
    // The acknowledged send moved the one-bit window.
    assert!(bench.wps.connection(bench.conn).arq().seq_num());
    // The frame left the queue; the next slot is a sync beacon.
    let state = bench.radio.borrow();
    assert_eq!(state.arms.last().unwrap().frame.len(), 2);
}

#[test]
fn node_receives_and_delivers_payload() {
    let bench = build(BenchCfg {
        role: Role::Node,
        tx_side: false,
        arq_enabled: true,
        ..BenchCfg::default()
    });
    let (rx_hits, rx_cb) = counter();
    bench.wps.set_rx_success_callback(bench.conn, rx_cb);

    let payload = b"hello node".to_vec();
    let mut bytes = main_header(0, false, 0);
    bytes.extend_from_slice(&payload);

    push_script(&bench.radio, SlotScript {
        main: outcome(FrameOutcome::Received),
        main_rx_bytes: bytes,
        ..SlotScript::default()
    });
    bench.wps.connect().unwrap();
    assert_eq!(bench.radio.borrow().arms.last().unwrap().dir, SlotDir::Rx);
    assert_eq!(bench.wps.slave_sync_state(), SlaveSyncState::Syncing);

    bench.wps.radio_irq();
    bench.wps.process_callbacks();

    assert_eq!(rx_hits.get(), 1);
    assert_eq!(bench.wps.receive(bench.conn).unwrap(), payload.as_slice());
    bench.wps.receive_complete(bench.conn).unwrap();
    assert!(matches!(
        bench.wps.receive(bench.conn),
        Err(Error::QueueEmpty)
    ));

    let stats = *bench.wps.connection(bench.conn).stats();
    assert_eq!(stats.rx_received, 1);
    assert_eq!(stats.rx_byte_received, payload.len() as u32);
    // One good frame from the coordinator locks the slave.
    assert_eq!(bench.wps.slave_sync_state(), SlaveSyncState::Synced);
    assert_eq!(bench.wps.frame_lost_count(), 0);
}

#[test]
fn duplicate_frame_is_suppressed() {
    let bench = build(BenchCfg {
        role: Role::Node,
        tx_side: false,
        arq_enabled: true,
        queue_size: 4,
        ..BenchCfg::default()
    });
    let (rx_hits, rx_cb) = counter();
    bench.wps.set_rx_success_callback(bench.conn, rx_cb);

    let mut bytes = main_header(0, false, 0);
    bytes.extend_from_slice(b"payload!");

    // The same SAW bit twice: a retransmission of a delivered frame.
    for _ in 0..2 {
        push_script(&bench.radio, SlotScript {
            main: outcome(FrameOutcome::Received),
            main_rx_bytes: bytes.clone(),
            ..SlotScript::default()
        });
    }
    bench.wps.connect().unwrap();
    bench.wps.radio_irq();
    bench.wps.radio_irq();
    bench.wps.process_callbacks();

    assert_eq!(rx_hits.get(), 1);
    assert_eq!(bench.wps.connection(bench.conn).arq().duplicate_count(), 1);
    let stats = *bench.wps.connection(bench.conn).stats();
    assert_eq!(stats.rx_received, 1);

    // The retransmission never reached the application queue.
    bench.wps.receive_complete(bench.conn).unwrap();
    assert!(matches!(
        bench.wps.receive(bench.conn),
        Err(Error::QueueEmpty)
    ));
}

#[test]
fn arq_deadline_drops_the_frame() {
    let bench = build(BenchCfg {
        arq_enabled: true,
        arq: ArqSettings {
            retry_count: 3,
            time_deadline_quarter_ms: 0,
        },
        ..BenchCfg::default()
    });
    let (drop_hits, drop_cb) = counter();
    let (fail_hits, fail_cb) = counter();
    bench.wps.set_tx_dropped_callback(bench.conn, drop_cb);
    bench.wps.set_tx_fail_callback(bench.conn, fail_cb);

    bench.wps.send(bench.conn, b"stubborn").unwrap();
    let saw_before = bench.wps.connection(bench.conn).arq().seq_num();

    // The receiver never acknowledges.
    for _ in 0..6 {
        push_script(&bench.radio, SlotScript {
            main: outcome(FrameOutcome::SentAckLost),
            ..SlotScript::default()
        });
    }
    bench.wps.connect().unwrap();
    for _ in 0..6 {
        bench.wps.radio_irq();
    }
    bench.wps.process_callbacks();

    assert_eq!(drop_hits.get(), 1);
    assert_eq!(fail_hits.get(), 3);
    let stats = *bench.wps.connection(bench.conn).stats();
    assert_eq!(stats.tx_drop, 1);
    assert_eq!(stats.tx_success, 0);
    assert_eq!(bench.wps.connection(bench.conn).arq().seq_num(), saw_before);

    // Exactly three on-air attempts carried the payload; later slots are
    // bare sync beacons.
    let state = bench.radio.borrow();
    let carrying = state
        .arms
        .iter()
        .filter(|arm| arm.frame.len() > 2)
        .count();
    assert_eq!(carrying, 3);

    // The queue is free again.
    drop(state);
    bench.wps.send(bench.conn, b"next").unwrap();
}

#[test]
fn time_deadline_expires_in_quarter_ms() {
    let bench = build(BenchCfg {
        arq_enabled: true,
        arq: ArqSettings {
            retry_count: 0,
            time_deadline_quarter_ms: 40,
        },
        ..BenchCfg::default()
    });
    let (drop_hits, drop_cb) = counter();
    bench.wps.set_tx_dropped_callback(bench.conn, drop_cb);

    bench.wps.send(bench.conn, b"timed").unwrap();
    for _ in 0..3 {
        push_script(&bench.radio, SlotScript {
            main: outcome(FrameOutcome::SentAckLost),
            ..SlotScript::default()
        });
    }
    bench.wps.connect().unwrap();
    bench.wps.radio_irq();
    assert_eq!(bench.wps.connection(bench.conn).stats().tx_drop, 0);

    // Jump past the deadline; the next slot acquisition flushes it.
    bench.tick.set(41);
    bench.wps.radio_irq();
    bench.wps.process_callbacks();

    assert_eq!(drop_hits.get(), 1);
    assert_eq!(bench.wps.connection(bench.conn).stats().tx_drop, 1);
}

#[test]
fn cca_abort_counts_and_sends_nothing() {
    let bench = build(BenchCfg {
        cca: Some(CcaCfg {
            threshold: 20,
            try_count: 2,
            retry_time_pll_cycles: 100,
            fail_action: CcaFailAction::Abort,
        }),
        ..BenchCfg::default()
    });
    let (tx_hits, tx_cb) = counter();
    bench.wps.set_tx_success_callback(bench.conn, tx_cb);

    bench.wps.send(bench.conn, b"blocked").unwrap();

    // The channel stayed busy through both sensing tries.
    push_script(&bench.radio, SlotScript {
        main: SlotOutcome {
            outcome: FrameOutcome::Wait,
            cca_try_count: 2,
            ..SlotOutcome::default()
        },
        ..SlotScript::default()
    });
    bench.wps.connect().unwrap();

    // CCA retries widen the listen budget.
    {
        let state = bench.radio.borrow();
        let arm = state.arms.last().unwrap();
        assert_eq!(arm.rx_timeout, (2 * 147 + 94 + 32) + 2 * 100);
    }

    bench.wps.radio_irq();
    bench.wps.process_callbacks();

    assert_eq!(tx_hits.get(), 0);
    let stats = *bench.wps.connection(bench.conn).stats();
    assert_eq!(stats.tx_success, 0);
    assert_eq!(stats.cca_fail, 1);
    assert_eq!(stats.cca_pass, 0);
    assert_eq!(stats.tx_fail, 1);
}

#[test]
fn throttle_keeps_two_slots_in_five_active() {
    let bench = build(BenchCfg {
        throttling: true,
        auto_sync: true,
        ..BenchCfg::default()
    });

    bench.wps.set_throttling_active_ratio(bench.conn, 40).unwrap();
    bench.wps.connect().unwrap();

    // 40 armed slots must consume exactly 100 superframes: the pattern is
    // 5 long with positions {0, 2} active, so consecutive arms swallow
    // alternately 2 and 3 superframes.
    for _ in 0..39 {
        bench.wps.radio_irq();
    }

    let slot_pll = uwblink::us_to_pll_cycles(1000);
    let state = bench.radio.borrow();
    assert_eq!(state.arms.len(), 40);
    let total_sleep: u64 = state.arms.iter().map(|a| a.sleep_cycles as u64).sum();
    // 100 superframes of budget, minus the idle offset per armed slot,
    // plus the one RX-to-TX transition on the very first arm.
    let expected = 100 * slot_pll as u64 - 40 + 147;
    assert_eq!(total_sleep, expected);
}

#[test]
fn ratio_hundred_keeps_every_slot() {
    let bench = build(BenchCfg {
        throttling: true,
        ..BenchCfg::default()
    });
    bench.wps.set_throttling_active_ratio(bench.conn, 100).unwrap();
    bench.wps.connect().unwrap();
    for _ in 0..10 {
        bench.wps.radio_irq();
    }
    let slot_pll = uwblink::us_to_pll_cycles(1000);
    let state = bench.radio.borrow();
    let total_sleep: u64 = state.arms.iter().map(|a| a.sleep_cycles as u64).sum();
    assert_eq!(total_sleep, 11 * slot_pll as u64 - 11 + 147);
}

#[test]
fn throttle_requires_the_feature() {
    let bench = build(BenchCfg::default());
    assert!(matches!(
        bench.wps.set_throttling_active_ratio(bench.conn, 50),
        Err(Error::ThrottleNotInitialized)
    ));
}

#[test]
fn empty_queue_emits_header_only_beacon() {
    let bench = build(BenchCfg {
        auto_sync: true,
        ..BenchCfg::default()
    });
    push_script(&bench.radio, SlotScript {
        main: outcome(FrameOutcome::SentAckLost),
        ..SlotScript::default()
    });
    bench.wps.connect().unwrap();

    {
        let state = bench.radio.borrow();
        // Nothing queued: the slot carries the two header bytes only.
        assert_eq!(state.arms.last().unwrap().frame.len(), 2);
    }
    bench.wps.radio_irq();

    // A sentinel slot does not count as a transmission.
    let stats = *bench.wps.connection(bench.conn).stats();
    assert_eq!(stats.tx_success, 0);
    assert_eq!(stats.tx_fail, 0);
}

#[test]
fn beacon_refreshes_sync_without_delivery() {
    let bench = build(BenchCfg {
        role: Role::Node,
        tx_side: false,
        ..BenchCfg::default()
    });
    let (rx_hits, rx_cb) = counter();
    bench.wps.set_rx_success_callback(bench.conn, rx_cb);

    // Header-only frame from the coordinator.
    push_script(&bench.radio, SlotScript {
        main: outcome(FrameOutcome::Received),
        main_rx_bytes: main_header(0, false, 0),
        ..SlotScript::default()
    });
    bench.wps.connect().unwrap();
    bench.wps.radio_irq();
    bench.wps.process_callbacks();

    assert_eq!(rx_hits.get(), 0);
    assert_eq!(bench.wps.connection(bench.conn).stats().rx_received, 0);
    assert_eq!(bench.wps.slave_sync_state(), SlaveSyncState::Synced);
    // The beacon must not disturb the ARQ duplicate tracking.
    assert_eq!(bench.wps.connection(bench.conn).arq().duplicate_count(), 0);
}

#[test]
fn slave_loses_sync_after_max_misses() {
    let bench = build(BenchCfg {
        role: Role::Node,
        tx_side: false,
        ..BenchCfg::default()
    });

    push_script(&bench.radio, SlotScript {
        main: outcome(FrameOutcome::Received),
        main_rx_bytes: main_header(0, false, 0),
        ..SlotScript::default()
    });
    bench.wps.connect().unwrap();
    bench.wps.radio_irq();
    assert_eq!(bench.wps.slave_sync_state(), SlaveSyncState::Synced);

    // 100 consecutive losses put the slave back to hunting.
    for _ in 0..99 {
        bench.wps.radio_irq();
        assert_eq!(bench.wps.slave_sync_state(), SlaveSyncState::Synced);
    }
    bench.wps.radio_irq();
    assert_eq!(bench.wps.slave_sync_state(), SlaveSyncState::Syncing);
}

#[test]
fn rx_queue_overrun_diverts_to_scratch() {
    let bench = build(BenchCfg {
        role: Role::Node,
        tx_side: false,
        queue_size: 1,
        ..BenchCfg::default()
    });
    let events: &'static RefCell<Vec<Event>> = Box::leak(Box::new(RefCell::new(Vec::new())));
    let event_cb: &'static dyn Fn(Event) =
        &*Box::leak(Box::new(move |e| events.borrow_mut().push(e)));
    bench.wps.set_event_callback(bench.conn, event_cb);

    let mut first = main_header(0, false, 0);
    first.extend_from_slice(b"first");
    let mut second = main_header(0, true, 0);
    second.extend_from_slice(b"second");

    push_script(&bench.radio, SlotScript {
        main: outcome(FrameOutcome::Received),
        main_rx_bytes: first,
        ..SlotScript::default()
    });
    push_script(&bench.radio, SlotScript {
        main: outcome(FrameOutcome::Received),
        main_rx_bytes: second,
        ..SlotScript::default()
    });

    bench.wps.connect().unwrap();
    bench.wps.radio_irq();
    // The application never reads, so the queue stays full.
    bench.wps.radio_irq();
    bench.wps.process_callbacks();

    let stats = *bench.wps.connection(bench.conn).stats();
    assert_eq!(stats.rx_received, 1);
    assert_eq!(stats.rx_overrun, 1);
    assert_eq!(events.borrow().as_slice(), &[Event::RxOverrun]);
    // The frame that made it is still readable.
    assert_eq!(bench.wps.receive(bench.conn).unwrap(), b"first");
}

#[test]
fn unsynced_node_suppresses_application_tx() {
    // A node transmitting toward the coordinator while still hunting must
    // send nothing but padding.
    let region = Box::leak(vec![0u8; 64 * 1024].into_boxed_slice());
    let pool: &'static mut MemPool<'static> = Box::leak(Box::new(MemPool::new(region)));
    let tick = Rc::new(Cell::new(0u64));
    let hal = MockHal {
        tick,
        context_switches: Rc::new(Cell::new(0)),
    };
    let mut wps = Wps::init(
        StackCfg {
            timeslot_duration_us: &[1000],
            channel_sequence: &[0],
            random_channel_sequence_enabled: false,
            fast_sync_enabled: false,
            rdo_rollover: None,
        },
        hal,
        pool,
    )
    .unwrap();
    wps.node_init(NodeCfg {
        role: Role::Node,
        pan_id: PAN_ID,
        coordinator_address: COORD_ADDR,
        local_address: NODE_ADDR,
        sleep_level: SleepLevel::Idle,
    })
    .unwrap();
    let radio = Rc::new(RefCell::new(RadioState::default()));
    wps.node_add_radio(ScriptedRadio {
        state: radio.clone(),
    })
    .unwrap();
    // Node-to-coordinator pipe.
    let conn = wps
        .connection_init(
            ConnectionCfg {
                source_address: NODE_ADDR,
                destination_address: COORD_ADDR,
                max_payload_size: 32,
                queue_size: 2,
                timeslot_ids: &[0],
                ack_enabled: true,
                auto_sync_enabled: false,
                ..ConnectionCfg::default()
            },
            pool,
        )
        .unwrap();
    wps.connection_add_channel(
        conn,
        ChannelCfg {
            frequency: 7875,
            tx_pulse_count: 2,
            tx_pulse_width: 6,
            tx_pulse_gain: 0,
            rx_pulse_count: 2,
        },
    )
    .unwrap();
    wps.setup().unwrap();

    wps.send(conn, b"not yet").unwrap();
    wps.connect().unwrap();

    let state = radio.borrow();
    // Still syncing: the payload must not be on air.
    assert!(state.arms.last().unwrap().frame.is_empty());
}

#[test]
fn register_requests_reach_the_radio() {
    let bench = build(BenchCfg::default());
    bench.wps.request_write_register(0x1f, 0xaa).unwrap();
    bench.wps.request_read_register(0x2e).unwrap();

    push_script(&bench.radio, SlotScript::default());
    bench.wps.connect().unwrap();

    assert_eq!(
        bench.radio.borrow().register_writes.as_slice(),
        &[(0x1f, 0xaa)]
    );
    assert_eq!(bench.wps.take_read_register_result(), Some((0x2e, 0x5a)));
    assert_eq!(bench.wps.take_read_register_result(), None);
}

#[test]
fn connect_disconnect_guards() {
    let bench = build(BenchCfg::default());
    assert!(matches!(
        bench.wps.disconnect(),
        Err(Error::AlreadyDisconnected)
    ));
    bench.wps.connect().unwrap();
    assert!(matches!(bench.wps.connect(), Err(Error::AlreadyConnected)));
    bench.wps.disconnect().unwrap();
    assert!(matches!(
        bench.wps.disconnect(),
        Err(Error::AlreadyDisconnected)
    ));
    bench.wps.connect().unwrap();
}

#[test]
fn queue_full_and_wrong_size_are_reported() {
    let bench = build(BenchCfg {
        queue_size: 2,
        ..BenchCfg::default()
    });
    bench.wps.send(bench.conn, b"one").unwrap();
    bench.wps.send(bench.conn, b"two").unwrap();
    assert!(matches!(
        bench.wps.send(bench.conn, b"three"),
        Err(Error::QueueFull)
    ));

    let oversized = [0u8; 64];
    let bench2 = build(BenchCfg::default());
    assert!(matches!(
        bench2.wps.send(bench2.conn, &oversized),
        Err(Error::WrongTxSize)
    ));
}

#[test]
fn arq_without_ack_is_rejected() {
    let region = Box::leak(vec![0u8; 64 * 1024].into_boxed_slice());
    let pool: &'static mut MemPool<'static> = Box::leak(Box::new(MemPool::new(region)));
    let tick = Rc::new(Cell::new(0u64));
    let hal = MockHal {
        tick,
        context_switches: Rc::new(Cell::new(0)),
    };
    let mut wps: Wps<'static, ScriptedRadio, MockHal> = Wps::init(
        StackCfg {
            timeslot_duration_us: &[1000],
            channel_sequence: &[0],
            random_channel_sequence_enabled: false,
            fast_sync_enabled: false,
            rdo_rollover: None,
        },
        hal,
        pool,
    )
    .unwrap();
    wps.node_init(NodeCfg {
        role: Role::Coordinator,
        pan_id: PAN_ID,
        coordinator_address: COORD_ADDR,
        local_address: COORD_ADDR,
        sleep_level: SleepLevel::Idle,
    })
    .unwrap();

    let result = wps.connection_init(
        ConnectionCfg {
            source_address: COORD_ADDR,
            destination_address: NODE_ADDR,
            timeslot_ids: &[0],
            ack_enabled: false,
            arq_enabled: true,
            ..ConnectionCfg::default()
        },
        pool,
    );
    assert!(matches!(result, Err(Error::AckDisabled)));
}

#[test]
fn auto_timeslot_ids_register_the_reply_half() {
    assert_eq!(auto_timeslot(3), 3 | (1 << 7));
    assert_eq!(auto_timeslot(0) & 0x7f, 0);
}

#[test]
fn fixed_payload_size_is_enforced() {
    let region = Box::leak(vec![0u8; 64 * 1024].into_boxed_slice());
    let pool: &'static mut MemPool<'static> = Box::leak(Box::new(MemPool::new(region)));
    let tick = Rc::new(Cell::new(0u64));
    let hal = MockHal {
        tick,
        context_switches: Rc::new(Cell::new(0)),
    };
    let mut wps = Wps::init(
        StackCfg {
            timeslot_duration_us: &[1000],
            channel_sequence: &[0],
            random_channel_sequence_enabled: false,
            fast_sync_enabled: false,
            rdo_rollover: None,
        },
        hal,
        pool,
    )
    .unwrap();
    wps.node_init(NodeCfg {
        role: Role::Coordinator,
        pan_id: PAN_ID,
        coordinator_address: COORD_ADDR,
        local_address: COORD_ADDR,
        sleep_level: SleepLevel::Idle,
    })
    .unwrap();
    let radio = Rc::new(RefCell::new(RadioState::default()));
    wps.node_add_radio(ScriptedRadio {
        state: radio.clone(),
    })
    .unwrap();
    let conn = wps
        .connection_init(
            ConnectionCfg {
                source_address: COORD_ADDR,
                destination_address: NODE_ADDR,
                timeslot_ids: &[0],
                fixed_payload_size: Some(8),
                ..ConnectionCfg::default()
            },
            pool,
        )
        .unwrap();

    assert!(matches!(
        wps.send(conn, b"short"),
        Err(Error::WrongTxSize)
    ));
    wps.send(conn, b"eight__b").unwrap();
}
