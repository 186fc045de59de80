use zephyrd_chainstate::{
    ActiveChain, BlockUndo, CacheView, CertStatusUpdate, ChainstateError, CoinEntry, NullView,
    ProofVerifier, SidechainState, StateView,
};
use zephyrd_consensus::{ChainParams, Hash256, SC_TX_VERSION};
use zephyrd_primitives::{
    BwtRequestOut, Certificate, ForwardTransferOut, OutPoint, ScCreationOut, Transaction, TxIn,
    TxOut,
};

const SC_MATURITY: u32 = 4;

fn params() -> ChainParams {
    ChainParams::regtest(Some(SC_MATURITY))
}

fn hash(tag: u8) -> Hash256 {
    let mut hash = [0u8; 32];
    hash[0] = tag;
    hash[31] = 0xdd;
    hash
}

fn block_hash(height: u32) -> Hash256 {
    let mut hash = [0u8; 32];
    hash[..4].copy_from_slice(&height.to_le_bytes());
    hash[31] = 0xbb;
    hash
}

struct AcceptAll;

impl ProofVerifier for AcceptAll {
    fn verify_cert(&self, _: &[u8], _: &[u8], _: &Hash256, _: &Certificate) -> bool {
        true
    }

    fn verify_bwt_request(
        &self,
        _: &Hash256,
        _: &[u8],
        _: &[u8],
        _: i64,
        _: &[u8],
        _: &[u8],
        _: &Hash256,
    ) -> bool {
        true
    }
}

struct RejectAll;

impl ProofVerifier for RejectAll {
    fn verify_cert(&self, _: &[u8], _: &[u8], _: &Hash256, _: &Certificate) -> bool {
        false
    }

    fn verify_bwt_request(
        &self,
        _: &Hash256,
        _: &[u8],
        _: &[u8],
        _: i64,
        _: &[u8],
        _: &[u8],
        _: &Hash256,
    ) -> bool {
        false
    }
}

struct MockChain {
    tip_height: u32,
}

impl ActiveChain for MockChain {
    fn height(&self) -> u32 {
        self.tip_height
    }

    fn contains(&self, target: &Hash256) -> bool {
        (0..=self.tip_height).any(|height| block_hash(height) == *target)
    }

    fn block_hash_at(&self, height: u32) -> Option<Hash256> {
        (height <= self.tip_height).then(|| block_hash(height))
    }
}

fn creation_out(sc_id: Hash256, value: i64) -> ScCreationOut {
    ScCreationOut {
        sc_id,
        value,
        withdrawal_epoch_length: 10,
        custom_data: vec![0x01],
        constant: vec![0x02],
        w_cert_vk: vec![0x03],
        w_mbtr_vk: None,
    }
}

fn creation_tx(sc_id: Hash256, value: i64) -> Transaction {
    Transaction {
        hash: hash(0x10),
        version: SC_TX_VERSION,
        vin: vec![TxIn::new(OutPoint::new(hash(0x11), 0))],
        sc_creations: vec![creation_out(sc_id, value)],
        ..Default::default()
    }
}

fn cert(sc_id: Hash256, tag: u8, epoch: i32, quality: i64, bwts: &[i64]) -> Certificate {
    let mut cert = Certificate::new(sc_id, hash(tag));
    cert.epoch_number = epoch;
    cert.quality = quality;
    cert.end_epoch_block_hash = block_hash(209);
    cert.data_hash = hash(tag ^ 0xff);
    cert.vout = bwts.iter().map(|value| TxOut::new(*value, vec![0x51])).collect();
    cert.first_bwt_pos = 0;
    cert
}

/// Creates sidechain `sc_id` with value 100 at height 200 and schedules its
/// events, mirroring block connect.
fn create_sidechain(cache: &mut CacheView<'_>, sc_id: Hash256) {
    let tx = creation_tx(sc_id, 100);
    cache
        .update_sidechain_on_tx(&tx, &block_hash(200), 200)
        .expect("create sidechain");
    cache
        .schedule_creation_event(&tx.sc_creations[0], 200)
        .expect("schedule creation");
}

#[test]
fn creation_schedules_maturity_and_ceasing() {
    let params = params();
    let sc_id = hash(0x01);
    let mut bottom = NullView;
    let mut cache = CacheView::new(&mut bottom, &params);

    create_sidechain(&mut cache, sc_id);

    let sidechain = cache.get_sidechain(&sc_id).expect("created");
    assert_eq!(sidechain.balance, 0);
    assert_eq!(sidechain.current_state, SidechainState::Alive);
    assert_eq!(sidechain.immature_amounts.get(&204), Some(&100));
    assert_eq!(sidechain.safeguard_margin(), 5);

    let maturing = cache.get_sidechain_events(204).expect("maturing event");
    assert!(maturing.maturing_scs.contains(&sc_id));
    let ceasing = cache.get_sidechain_events(215).expect("ceasing event");
    assert!(ceasing.ceasing_scs.contains(&sc_id));

    // At height 204 the creation amount matures.
    let mut undo = BlockUndo::new();
    cache
        .handle_sidechain_events(204, &mut undo, None)
        .expect("handle events");
    let sidechain = cache.get_sidechain(&sc_id).expect("still present");
    assert_eq!(sidechain.balance, 100);
    assert!(sidechain.immature_amounts.is_empty());
    assert!(!cache.have_sidechain_events(204));
    let sc_undo = &undo.sc_undo_by_scid[&sc_id];
    assert_eq!(sc_undo.applied_matured_amount, 100);
    assert!(sc_undo.content_bit_mask & zephyrd_chainstate::SidechainUndo::MATURED_AMOUNTS != 0);
}

#[test]
fn certificate_moves_the_ceasing_deadline() {
    let params = params();
    let sc_id = hash(0x02);
    let mut bottom = NullView;
    let mut cache = CacheView::new(&mut bottom, &params);

    create_sidechain(&mut cache, sc_id);
    let mut undo = BlockUndo::new();
    cache
        .handle_sidechain_events(204, &mut undo, None)
        .expect("mature");

    let cert0 = cert(sc_id, 0x20, 0, 5, &[30]);
    let mut block_undo = BlockUndo::new();
    cache
        .update_sidechain_on_cert(&cert0, &mut block_undo)
        .expect("connect cert");
    cache.schedule_cert_event(&cert0).expect("reschedule ceasing");

    let sidechain = cache.get_sidechain(&sc_id).expect("present");
    assert_eq!(sidechain.balance, 70);
    assert_eq!(sidechain.last_top_quality_cert_quality, 5);
    assert_eq!(sidechain.last_top_quality_cert_referenced_epoch, 0);

    assert!(!cache.have_sidechain_events(215));
    let ceasing = cache.get_sidechain_events(225).expect("moved deadline");
    assert!(ceasing.ceasing_scs.contains(&sc_id));
}

#[test]
fn same_epoch_supersession_and_undo_roundtrip() {
    let params = params();
    let sc_id = hash(0x03);
    let mut bottom = NullView;
    let mut cache = CacheView::new(&mut bottom, &params);

    create_sidechain(&mut cache, sc_id);
    let mut undo = BlockUndo::new();
    cache
        .handle_sidechain_events(204, &mut undo, None)
        .expect("mature");

    let cert0 = cert(sc_id, 0x20, 0, 5, &[30]);
    let mut block_undo0 = BlockUndo::new();
    cache
        .update_sidechain_on_cert(&cert0, &mut block_undo0)
        .expect("connect first cert");
    cache.schedule_cert_event(&cert0).expect("reschedule");

    // The first certificate's coins, as block connect would leave them.
    {
        let mut coins = cache.modify_coins(&cert0.hash);
        *coins = CoinEntry::from_certificate(&cert0, 212, 225, true);
    }
    let cert0_coins = cache.get_coins(&cert0.hash).expect("cert coins");

    let snapshot = cache.get_sidechain(&sc_id).expect("snapshot");

    let cert1 = cert(sc_id, 0x21, 0, 7, &[40]);
    let mut block_undo1 = BlockUndo::new();
    cache
        .update_sidechain_on_cert(&cert1, &mut block_undo1)
        .expect("supersede");

    let superseded = cache.get_sidechain(&sc_id).expect("present");
    assert_eq!(superseded.balance, 60);
    assert_eq!(superseded.last_top_quality_cert_quality, 7);

    // Supersession voids the previous top certificate's backward transfers.
    {
        let sc_undo = block_undo1.sc_undo_entry(&sc_id);
        sc_undo.content_bit_mask |= zephyrd_chainstate::SidechainUndo::SUPERSEDED_CERT_DATA;
        cache.nullify_backward_transfers(&cert0.hash, &mut sc_undo.superseded_bwts);
    }
    assert!(!cache.have_coins(&cert0.hash));
    assert_eq!(block_undo1.sc_undo_by_scid[&sc_id].superseded_bwts.len(), 1);
    assert!(block_undo1.sc_undo_by_scid[&sc_id].superseded_bwts[0].has_provenance());

    // The ceasing deadline was already moved by the first certificate; the
    // replay is accepted without changes.
    cache.schedule_cert_event(&cert1).expect("idempotent reschedule");
    assert!(!cache.have_sidechain_events(215));
    assert!(cache.get_sidechain_events(225).expect("unchanged").ceasing_scs.contains(&sc_id));

    // Reverting the supersession restores every field and the voided coins.
    let sc_undo = block_undo1.sc_undo_by_scid[&sc_id].clone();
    cache
        .restore_sidechain_from_cert(&cert1, &sc_undo)
        .expect("restore");
    assert_eq!(cache.get_sidechain(&sc_id).expect("restored"), snapshot);

    cache
        .restore_backward_transfers(&cert0.hash, &sc_undo.superseded_bwts)
        .expect("restore bwts");
    assert_eq!(cache.get_coins(&cert0.hash).expect("coins back"), cert0_coins);
}

#[test]
fn cross_epoch_cert_undo_roundtrip() {
    let params = params();
    let sc_id = hash(0x04);
    let mut bottom = NullView;
    let mut cache = CacheView::new(&mut bottom, &params);

    create_sidechain(&mut cache, sc_id);
    let mut undo = BlockUndo::new();
    cache
        .handle_sidechain_events(204, &mut undo, None)
        .expect("mature");

    let cert0 = cert(sc_id, 0x20, 0, 5, &[30]);
    let mut block_undo0 = BlockUndo::new();
    cache
        .update_sidechain_on_cert(&cert0, &mut block_undo0)
        .expect("epoch 0 cert");

    let snapshot = cache.get_sidechain(&sc_id).expect("snapshot");

    let cert1 = cert(sc_id, 0x22, 1, 3, &[10]);
    let mut block_undo1 = BlockUndo::new();
    cache
        .update_sidechain_on_cert(&cert1, &mut block_undo1)
        .expect("epoch 1 cert");

    let advanced = cache.get_sidechain(&sc_id).expect("present");
    assert_eq!(advanced.balance, 60);
    assert_eq!(advanced.last_top_quality_cert_referenced_epoch, 1);
    assert_eq!(
        advanced.past_epoch_top_quality_cert_data_hash,
        snapshot.last_top_quality_cert_data_hash
    );
    let sc_undo = block_undo1.sc_undo_by_scid[&sc_id].clone();
    assert!(
        sc_undo.content_bit_mask & zephyrd_chainstate::SidechainUndo::CROSS_EPOCH_CERT_DATA != 0
    );

    cache
        .restore_sidechain_from_cert(&cert1, &sc_undo)
        .expect("restore");
    assert_eq!(cache.get_sidechain(&sc_id).expect("restored"), snapshot);
}

#[test]
fn cert_epoch_and_quality_rejections() {
    let params = params();
    let sc_id = hash(0x05);
    let mut bottom = NullView;
    let mut cache = CacheView::new(&mut bottom, &params);

    create_sidechain(&mut cache, sc_id);
    let mut undo = BlockUndo::new();
    cache
        .handle_sidechain_events(204, &mut undo, None)
        .expect("mature");

    let cert0 = cert(sc_id, 0x20, 0, 5, &[30]);
    let mut block_undo = BlockUndo::new();
    cache
        .update_sidechain_on_cert(&cert0, &mut block_undo)
        .expect("epoch 0 cert");

    // Same epoch, equal quality.
    let equal = cert(sc_id, 0x23, 0, 5, &[10]);
    assert!(matches!(
        cache.update_sidechain_on_cert(&equal, &mut BlockUndo::new()),
        Err(ChainstateError::QualityRejected)
    ));

    // Epoch too far ahead.
    let skipped = cert(sc_id, 0x24, 2, 9, &[10]);
    assert!(matches!(
        cache.update_sidechain_on_cert(&skipped, &mut BlockUndo::new()),
        Err(ChainstateError::Inconsistent(_))
    ));

    // Overdraw: balance is 70 after the first certificate.
    let greedy = cert(sc_id, 0x25, 1, 1, &[200]);
    assert!(matches!(
        cache.update_sidechain_on_cert(&greedy, &mut BlockUndo::new()),
        Err(ChainstateError::InsufficientBalance)
    ));
}

#[test]
fn ceasing_nullifies_and_revert_restores() {
    let params = params();
    let sc_id = hash(0x06);
    let mut bottom = NullView;
    let mut cache = CacheView::new(&mut bottom, &params);

    create_sidechain(&mut cache, sc_id);
    let mut undo = BlockUndo::new();
    cache
        .handle_sidechain_events(204, &mut undo, None)
        .expect("mature");

    // Connect an epoch-0 certificate with one change output and one bwt.
    let mut cert0 = cert(sc_id, 0x20, 0, 5, &[30]);
    cert0.vout = vec![TxOut::new(5, vec![0x52]), TxOut::new(30, vec![0x51])];
    cert0.first_bwt_pos = 1;
    let mut block_undo = BlockUndo::new();
    cache
        .update_sidechain_on_cert(&cert0, &mut block_undo)
        .expect("connect cert");
    cache.schedule_cert_event(&cert0).expect("reschedule");
    {
        let mut coins = cache.modify_coins(&cert0.hash);
        *coins = CoinEntry::from_certificate(&cert0, 212, 225, true);
    }
    let coins_before = cache.get_coins(&cert0.hash).expect("cert coins");

    // No further certificate: the sidechain ceases at 225.
    let mut cease_undo = BlockUndo::new();
    let mut updates: Vec<CertStatusUpdate> = Vec::new();
    cache
        .handle_sidechain_events(225, &mut cease_undo, Some(&mut updates))
        .expect("cease");

    assert_eq!(cache.get_sidechain_state(&sc_id), SidechainState::Ceased);
    let nulled = cache.get_coins(&cert0.hash).expect("change remains");
    assert!(nulled.is_available(0));
    assert!(!nulled.is_available(1));
    let sc_undo = &cease_undo.sc_undo_by_scid[&sc_id];
    assert!(sc_undo.content_bit_mask & zephyrd_chainstate::SidechainUndo::CEASED_CERT_DATA != 0);
    assert_eq!(sc_undo.ceased_bwts.len(), 1);
    assert_eq!(sc_undo.ceased_bwts[0].txout.value, 30);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].bwt_state, zephyrd_chainstate::BwtState::Off);
    assert!(!cache.have_sidechain_events(225));

    // Reorg: the revert restores the state and the bwt outputs exactly.
    let mut revert_updates: Vec<CertStatusUpdate> = Vec::new();
    cache
        .revert_sidechain_events(&cease_undo, 225, Some(&mut revert_updates))
        .expect("revert");
    assert_eq!(cache.get_sidechain_state(&sc_id), SidechainState::Alive);
    assert_eq!(cache.get_coins(&cert0.hash).expect("restored"), coins_before);
    assert_eq!(revert_updates.len(), 1);
    assert_eq!(revert_updates[0].bwt_state, zephyrd_chainstate::BwtState::On);
    let recreated = cache.get_sidechain_events(225).expect("event recreated");
    assert!(recreated.ceasing_scs.contains(&sc_id));
}

#[test]
fn ceasing_without_certificate_prunes_nothing() {
    let params = params();
    let sc_id = hash(0x07);
    let mut bottom = NullView;
    let mut cache = CacheView::new(&mut bottom, &params);

    create_sidechain(&mut cache, sc_id);
    let mut undo = BlockUndo::new();
    cache
        .handle_sidechain_events(204, &mut undo, None)
        .expect("mature");

    let mut cease_undo = BlockUndo::new();
    cache
        .handle_sidechain_events(215, &mut cease_undo, None)
        .expect("cease");
    assert_eq!(cache.get_sidechain_state(&sc_id), SidechainState::Ceased);
    assert!(cease_undo.sc_undo_by_scid[&sc_id].ceased_bwts.is_empty());

    cache
        .revert_sidechain_events(&cease_undo, 215, None)
        .expect("revert");
    assert_eq!(cache.get_sidechain_state(&sc_id), SidechainState::Alive);
}

#[test]
fn event_schedule_cancel_roundtrip() {
    let params = params();
    let sc_id = hash(0x08);
    let mut bottom = NullView;
    let mut cache = CacheView::new(&mut bottom, &params);

    create_sidechain(&mut cache, sc_id);
    let creation = creation_out(sc_id, 100);
    cache
        .cancel_creation_event(&creation, 200)
        .expect("cancel creation events");
    assert!(!cache.have_sidechain_events(204));
    assert!(!cache.have_sidechain_events(215));

    // Forward transfers are maturing-only; the pair cancels to nothing too.
    let forward = ForwardTransferOut { sc_id, value: 25 };
    cache
        .schedule_forward_event(&forward, 300)
        .expect("schedule forward");
    assert!(cache.have_sidechain_events(304));
    cache
        .cancel_forward_event(&forward, 300)
        .expect("cancel forward");
    assert!(!cache.have_sidechain_events(304));
    // Cancelling again is benign: another transfer may have emptied it.
    cache
        .cancel_forward_event(&forward, 300)
        .expect("cancel again");
}

#[test]
fn cert_event_cancel_restores_previous_deadline() {
    let params = params();
    let sc_id = hash(0x09);
    let mut bottom = NullView;
    let mut cache = CacheView::new(&mut bottom, &params);

    create_sidechain(&mut cache, sc_id);
    let mut undo = BlockUndo::new();
    cache
        .handle_sidechain_events(204, &mut undo, None)
        .expect("mature");

    let cert0 = cert(sc_id, 0x20, 0, 5, &[30]);
    let mut block_undo = BlockUndo::new();
    cache
        .update_sidechain_on_cert(&cert0, &mut block_undo)
        .expect("connect");
    cache.schedule_cert_event(&cert0).expect("reschedule");
    assert!(cache.have_sidechain_events(225));
    assert!(!cache.have_sidechain_events(215));

    cache.cancel_cert_event(&cert0).expect("cancel");
    assert!(!cache.have_sidechain_events(225));
    assert!(cache.get_sidechain_events(215).expect("restored").ceasing_scs.contains(&sc_id));

    // Replaying the cancel after the deadlines already moved back succeeds.
    cache.cancel_cert_event(&cert0).expect("idempotent cancel");
}

#[test]
fn forward_transfers_accumulate_and_revert() {
    let params = params();
    let sc_id = hash(0x0a);
    let mut bottom = NullView;
    let mut cache = CacheView::new(&mut bottom, &params);

    create_sidechain(&mut cache, sc_id);

    let forwards = Transaction {
        hash: hash(0x30),
        version: SC_TX_VERSION,
        vin: vec![TxIn::new(OutPoint::new(hash(0x31), 0))],
        forward_transfers: vec![
            ForwardTransferOut { sc_id, value: 10 },
            ForwardTransferOut { sc_id, value: 15 },
        ],
        ..Default::default()
    };
    cache
        .update_sidechain_on_tx(&forwards, &block_hash(201), 201)
        .expect("apply forwards");
    let sidechain = cache.get_sidechain(&sc_id).expect("present");
    assert_eq!(sidechain.immature_amounts.get(&205), Some(&25));

    cache
        .revert_tx_outputs(&forwards, 201)
        .expect("revert forwards");
    let sidechain = cache.get_sidechain(&sc_id).expect("present");
    assert_eq!(sidechain.immature_amounts.get(&205), None);
    assert_eq!(sidechain.immature_amounts.get(&204), Some(&100));

    // Reverting the creation itself removes the sidechain.
    let creation = creation_tx(sc_id, 100);
    cache
        .revert_tx_outputs(&creation, 200)
        .expect("revert creation");
    assert!(!cache.have_sidechain(&sc_id));
}

#[test]
fn cert_applicability_checks() {
    let params = params();
    let sc_id = hash(0x0b);
    let mut bottom = NullView;
    let mut cache = CacheView::new(&mut bottom, &params);

    create_sidechain(&mut cache, sc_id);
    let mut undo = BlockUndo::new();
    cache
        .handle_sidechain_events(204, &mut undo, None)
        .expect("mature");

    let chain = MockChain { tip_height: 212 };
    let cert0 = cert(sc_id, 0x20, 0, 5, &[30]);

    cache
        .is_cert_applicable(&cert0, 212, &AcceptAll, &chain)
        .expect("applicable");

    // Outside the submission window.
    assert!(matches!(
        cache.is_cert_applicable(&cert0, 216, &AcceptAll, &chain),
        Err(ChainstateError::Inconsistent(_))
    ));

    // Overdrawing bwt amount.
    let greedy = cert(sc_id, 0x26, 0, 6, &[150]);
    assert!(matches!(
        cache.is_cert_applicable(&greedy, 212, &AcceptAll, &chain),
        Err(ChainstateError::InsufficientBalance)
    ));

    // Proof rejection is surfaced as such.
    assert!(matches!(
        cache.is_cert_applicable(&cert0, 212, &RejectAll, &chain),
        Err(ChainstateError::ProofInvalid)
    ));

    // Unknown sidechain.
    let stranger = cert(hash(0x6f), 0x27, 0, 5, &[1]);
    assert!(matches!(
        cache.is_cert_applicable(&stranger, 212, &AcceptAll, &chain),
        Err(ChainstateError::NotFound(_))
    ));
}

#[test]
fn quality_check_against_current_top() {
    let params = params();
    let sc_id = hash(0x0c);
    let mut bottom = NullView;
    let mut cache = CacheView::new(&mut bottom, &params);

    create_sidechain(&mut cache, sc_id);
    let mut undo = BlockUndo::new();
    cache
        .handle_sidechain_events(204, &mut undo, None)
        .expect("mature");

    let cert0 = cert(sc_id, 0x20, 0, 5, &[30]);
    let mut block_undo = BlockUndo::new();
    cache
        .update_sidechain_on_cert(&cert0, &mut block_undo)
        .expect("connect");

    // The connected certificate itself stays acceptable.
    assert!(cache.check_quality(&cert0));
    // A weaker or equal same-epoch competitor is not.
    assert!(!cache.check_quality(&cert(sc_id, 0x28, 0, 5, &[1])));
    assert!(!cache.check_quality(&cert(sc_id, 0x28, 0, 4, &[1])));
    // Better quality or another epoch is fine.
    assert!(cache.check_quality(&cert(sc_id, 0x28, 0, 6, &[1])));
    assert!(cache.check_quality(&cert(sc_id, 0x28, 1, 1, &[1])));
}

#[test]
fn tx_applicability_checks() {
    let params = params();
    let sc_id = hash(0x0d);
    let mut bottom = NullView;
    let mut cache = CacheView::new(&mut bottom, &params);

    create_sidechain(&mut cache, sc_id);
    let chain = MockChain { tip_height: 204 };

    // Recreating an existing sidechain is rejected.
    let duplicate = creation_tx(sc_id, 50);
    assert!(matches!(
        cache.is_tx_applicable(&duplicate, &AcceptAll, &chain),
        Err(ChainstateError::Inconsistent(_))
    ));

    // Forward transfer to a live sidechain is fine, to an unknown one only
    // if the same transaction creates it.
    let fresh_id = hash(0x0e);
    let mut forward_tx = Transaction {
        hash: hash(0x32),
        version: SC_TX_VERSION,
        vin: vec![TxIn::new(OutPoint::new(hash(0x33), 0))],
        forward_transfers: vec![ForwardTransferOut { sc_id: fresh_id, value: 5 }],
        ..Default::default()
    };
    assert!(matches!(
        cache.is_tx_applicable(&forward_tx, &AcceptAll, &chain),
        Err(ChainstateError::NotFound(_))
    ));
    forward_tx.sc_creations = vec![creation_out(fresh_id, 10)];
    cache
        .is_tx_applicable(&forward_tx, &AcceptAll, &chain)
        .expect("creation plus forward");

    // Backward-transfer requests need the sidechain to declare a verifying key.
    let request_tx = Transaction {
        hash: hash(0x34),
        version: SC_TX_VERSION,
        vin: vec![TxIn::new(OutPoint::new(hash(0x35), 0))],
        bwt_requests: vec![BwtRequestOut {
            sc_id,
            sc_request_data: vec![0x01],
            mc_destination_address: vec![0x02],
            sc_fee: 1,
            sc_proof: vec![0x03],
        }],
        ..Default::default()
    };
    assert!(matches!(
        cache.is_tx_applicable(&request_tx, &AcceptAll, &chain),
        Err(ChainstateError::Inconsistent(_))
    ));
}

#[test]
fn active_cert_data_hash_follows_the_safeguard() {
    let params = params();
    let sc_id = hash(0x0f);
    let mut bottom = NullView;
    let mut cache = CacheView::new(&mut bottom, &params);

    create_sidechain(&mut cache, sc_id);
    let mut undo = BlockUndo::new();
    cache
        .handle_sidechain_events(204, &mut undo, None)
        .expect("mature");

    let cert0 = cert(sc_id, 0x20, 0, 5, &[30]);
    let mut block_undo = BlockUndo::new();
    cache
        .update_sidechain_on_cert(&cert0, &mut block_undo)
        .expect("connect");

    let sidechain = cache.get_sidechain(&sc_id).expect("present");

    // Inside epoch 1, before its safeguard deadline (215), the previous
    // epoch's hash is still the active one.
    let early = MockChain { tip_height: 212 };
    assert_eq!(
        cache.get_active_cert_data_hash(&sc_id, &early),
        Some(sidechain.past_epoch_top_quality_cert_data_hash)
    );

    let late = MockChain { tip_height: 216 };
    assert_eq!(
        cache.get_active_cert_data_hash(&sc_id, &late),
        Some(sidechain.last_top_quality_cert_data_hash)
    );
}

#[test]
fn sc_ids_overlay_base_and_cache() {
    let params = params();
    let kept = hash(0x41);
    let added = hash(0x42);

    let mut bottom = NullView;
    let mut parent = CacheView::new(&mut bottom, &params);
    create_sidechain(&mut parent, kept);

    let mut child = CacheView::new(&mut parent, &params);
    let tx = Transaction {
        hash: hash(0x43),
        version: SC_TX_VERSION,
        vin: vec![TxIn::new(OutPoint::new(hash(0x44), 0))],
        sc_creations: vec![creation_out(added, 10)],
        ..Default::default()
    };
    child
        .update_sidechain_on_tx(&tx, &block_hash(201), 201)
        .expect("create in child");

    let mut ids = std::collections::BTreeSet::new();
    child.get_sc_ids(&mut ids);
    assert!(ids.contains(&kept));
    assert!(ids.contains(&added));

    child.revert_tx_outputs(&tx, 201).expect("erase in child");
    let mut ids = std::collections::BTreeSet::new();
    child.get_sc_ids(&mut ids);
    assert!(ids.contains(&kept));
    assert!(!ids.contains(&added));
}
