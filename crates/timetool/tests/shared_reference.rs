use std::sync::Arc;

use timetool::{
    ConfigMismatch, Cut, EventType, Fex, FexConfig, FexParams, PulseStatus, ReferenceKey,
    ReferenceMode, ReferenceSlot, ReferenceStore, ReferenceTrace, Roi,
};

const LEN: usize = 96;

fn params(dir: &std::path::Path) -> FexParams {
    FexParams {
        phy: 0x1b00_0a00,
        sig_roi: Roi::new(0, 0, 0, LEN - 1),
        sb_roi: Some(Roi::new(1, 1, 0, LEN - 1)),
        weights: vec![-1.0, -1.0, 1.0, 1.0],
        reference_dir: Some(dir.to_path_buf()),
        ..FexParams::default()
    }
}

fn step_at(edge: usize) -> Vec<i64> {
    (0..LEN).map(|i| if i >= edge { 3000 } else { 2000 }).collect()
}

#[test]
fn learned_reference_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let sb = vec![0i64; LEN];
    let baseline: Vec<i64> = (0..LEN).map(|i| 2000 + (i as i64 % 7)).collect();

    let mut first = Fex::with_store(
        FexConfig::new(params(dir.path())).unwrap(),
        Arc::new(ReferenceStore::new()),
    );
    assert!(first.configure().loaded.is_empty());
    first
        .analyze_projections(&baseline, &sb, None, EventType::Reference)
        .unwrap();
    let learned = first
        .store()
        .snapshot(first.reference_key(ReferenceSlot::NoBeam))
        .unwrap();
    first.unconfigure().unwrap();
    assert!(dir.path().join("timetool.ref.1b000a00").exists());

    // Fresh process: new store, same channel and directory.
    let mut second = Fex::with_store(
        FexConfig::new(params(dir.path())).unwrap(),
        Arc::new(ReferenceStore::new()),
    );
    let report = second.configure();
    assert_eq!(report.loaded, vec![ReferenceSlot::NoBeam]);
    assert!(report.mismatches.is_empty());
    let reloaded = second
        .store()
        .snapshot(second.reference_key(ReferenceSlot::NoBeam))
        .unwrap();
    assert_eq!(reloaded, learned);

    assert_eq!(
        second
            .analyze_projections(&step_at(40), &sb, None, EventType::Signal)
            .unwrap(),
        PulseStatus::Analyzed
    );
}

#[test]
fn wrong_size_reference_file_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let key = ReferenceKey::new(0x1b00_0a00, ReferenceSlot::NoBeam);
    ReferenceTrace::from_row(vec![1.0; 10])
        .save(key.path_in(Some(dir.path())))
        .unwrap();

    let mut fex = Fex::with_store(
        FexConfig::new(params(dir.path())).unwrap(),
        Arc::new(ReferenceStore::new()),
    );
    let report = fex.configure();
    assert!(report.loaded.is_empty());
    assert!(matches!(
        report.mismatches.as_slice(),
        [ConfigMismatch::ReferenceShape {
            expected: [1, LEN],
            found: [1, 10],
            ..
        }]
    ));
    assert!(!fex.store().contains(key));
}

#[test]
fn reference_region_slot_persists_with_suffix() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = params(dir.path());
    p.ref_mode = ReferenceMode::Region;
    p.ref_roi = Some(Roi::new(2, 2, 0, LEN - 1));
    let mut fex = Fex::with_store(FexConfig::new(p).unwrap(), Arc::new(ReferenceStore::new()));
    fex.configure();

    let sb = vec![0i64; LEN];
    let ref_trace = vec![2000i64; LEN];
    assert_eq!(
        fex.analyze_projections(&step_at(50), &sb, Some(&ref_trace), EventType::Signal)
            .unwrap(),
        PulseStatus::Analyzed
    );
    fex.unconfigure().unwrap();
    assert!(dir.path().join("timetool.ref.1b000a00.roi").exists());
    assert!(!dir.path().join("timetool.ref.1b000a00").exists());
}

#[test]
fn workers_share_one_reference() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ReferenceStore::new());
    let sb = vec![0i64; LEN];
    let workers = 4;
    let pulses_per_worker = 50;
    // Each worker sees its own beam-off trace; with full convergence the
    // stored trace is always exactly the last one rolled in.
    let inputs: Vec<Vec<i64>> = (0..workers)
        .map(|w| (0..LEN).map(|i| 1000 * (w as i64 + 1) + i as i64).collect())
        .collect();

    let statuses: Vec<Vec<PulseStatus>> = std::thread::scope(|s| {
        let handles: Vec<_> = inputs
            .iter()
            .map(|baseline| {
                let store = Arc::clone(&store);
                let sb = &sb;
                let mut p = params(dir.path());
                p.ref_convergence = 1.0;
                let config = FexConfig::new(p).unwrap();
                s.spawn(move || {
                    let mut fex = Fex::with_store(config, store);
                    fex.configure();
                    let mut out = Vec::new();
                    for k in 0..pulses_per_worker {
                        // Interleave beam-off and signal pulses per worker.
                        let status = if k % 2 == 0 {
                            fex.analyze_projections(baseline, sb, None, EventType::Reference)
                        } else {
                            fex.analyze_projections(&step_at(30), sb, None, EventType::Signal)
                        };
                        out.push(status.unwrap());
                    }
                    out
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let key = ReferenceKey::new(0x1b00_0a00, ReferenceSlot::NoBeam);
    let trace = store.snapshot(key).unwrap();
    assert_eq!(trace.shape(), [1, LEN]);
    let matching: Vec<usize> = inputs
        .iter()
        .enumerate()
        .filter(|(_, input)| {
            input
                .iter()
                .zip(trace.data())
                .all(|(&a, &b)| a as f64 == b)
        })
        .map(|(w, _)| w)
        .collect();
    assert_eq!(matching.len(), 1, "stored trace mixes worker inputs");

    // Every pulse after a worker's first beam-off pulse sees a reference.
    for worker in &statuses {
        assert_eq!(worker[0], PulseStatus::ReferenceUpdated);
        assert!(worker[1..]
            .iter()
            .all(|s| *s != PulseStatus::Dropped(Cut::NoReference)));
    }
}
