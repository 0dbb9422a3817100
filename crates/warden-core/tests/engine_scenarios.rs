//! End-to-end scenarios driven through the engine entry point.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use warden_core::digest::Digest;
use warden_core::event::{EventParams, MemoryFile};
use warden_core::model::pseudonym_digest;
use warden_core::prelude::*;

fn test_engine() -> Engine {
    Engine::new(&EngineConfig {
        magazine_size: 16,
        ..EngineConfig::default()
    })
    .unwrap()
}

fn internal_domain(engine: &Engine) -> Arc<warden_core::Context> {
    engine
        .create_domain(
            None,
            DomainType::Internal,
            &DomainConfig {
                magazine_size: 16,
                ..DomainConfig::default()
            },
        )
        .unwrap()
}

fn external_domain(engine: &Engine, key_byte: &str) -> Arc<warden_core::Context> {
    engine
        .create_domain(
            None,
            DomainType::External,
            &DomainConfig {
                auth_key_hex: Some(key_byte.repeat(32)),
                magazine_size: 16,
                ..DomainConfig::default()
            },
        )
        .unwrap()
}

fn test_task(pid: u32) -> Arc<TaskState> {
    TaskState::new(pid, "scenario", Credentials::uniform(1000))
}

fn open_file(
    engine: &Engine,
    domain: &Arc<warden_core::Context>,
    task: &Arc<TaskState>,
    file: &MemoryFile,
) {
    engine
        .handle_hook(
            domain,
            task,
            EventKind::FileOpen,
            EventParams::File { file },
            false,
        )
        .unwrap();
}

#[test]
fn duplicate_events_collapse_to_one_point() {
    let engine = test_engine();
    let domain = internal_domain(&engine);
    let task = test_task(1);
    let file = MemoryFile::new("/tmp/a", b"contents");

    open_file(&engine, &domain, &task, &file);
    let model = domain.model().unwrap();
    let single_measurement = model.measurement();

    open_file(&engine, &domain, &task, &file);

    let points = model.points();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].count, 2);
    assert!(points[0].valid);
    assert_eq!(model.trajectory().len(), 1);
    assert_eq!(model.measurement(), single_measurement);
    assert_eq!(task.trust_status(), TrustStatus::Trusted);
}

#[test]
fn seal_then_novel_event_is_forensic() {
    let engine = test_engine();
    let domain = internal_domain(&engine);
    let task = test_task(2);

    let first = MemoryFile::new("/tmp/first", b"one");
    open_file(&engine, &domain, &task, &first);
    assert_eq!(task.trust_status(), TrustStatus::Trusted);

    domain.seal();

    let second = MemoryFile::new("/tmp/second", b"two");
    open_file(&engine, &domain, &task, &second);

    let model = domain.model().unwrap();
    assert_eq!(model.trajectory().len(), 1);
    assert_eq!(model.forensics().len(), 1);
    assert_eq!(model.points().len(), 2);
    assert_eq!(task.trust_status(), TrustStatus::Untrusted);

    // The forensic event is replayable: the same coefficient stays
    // invalid and keeps marking callers.
    let replay = test_task(3);
    open_file(&engine, &domain, &replay, &second);
    assert_eq!(replay.trust_status(), TrustStatus::Untrusted);
    assert_eq!(model.forensics().len(), 1);
}

#[test]
fn state_is_insertion_order_independent() {
    let engine = test_engine();
    let d1 = internal_domain(&engine);
    let d2 = internal_domain(&engine);
    let task = test_task(4);

    let e1 = MemoryFile::new("/tmp/e1", b"first file");
    let e2 = MemoryFile::new("/tmp/e2", b"second file");

    open_file(&engine, &d1, &task, &e1);
    open_file(&engine, &d1, &task, &e2);
    open_file(&engine, &d2, &task, &e2);
    open_file(&engine, &d2, &task, &e1);

    let m1 = d1.model().unwrap();
    let m2 = d2.model().unwrap();
    m1.compute_state();
    m2.compute_state();

    assert_eq!(m1.state(), m2.state());
    assert_ne!(m1.measurement(), m2.measurement());
}

#[test]
fn pseudonym_zeroes_content_digest_and_stabilizes_coefficient() {
    let engine = test_engine();
    let domain = internal_domain(&engine);
    let task = test_task(5);

    domain
        .load_pseudonym(pseudonym_digest(domain.algorithm(), "/etc/passwd"))
        .unwrap();

    let file = MemoryFile::new("/etc/passwd", b"root:x:0:0\n");
    open_file(&engine, &domain, &task, &file);

    let model = domain.model().unwrap();
    let first = *model.trajectory()[0].coefficient();

    // Different bytes, same pathname: identity is erased either way.
    file.write(b"totally different contents");
    open_file(&engine, &domain, &task, &file);

    assert_eq!(model.points().len(), 1);
    assert_eq!(model.points()[0].count, 2);
    let zero = domain.zero_digest();
    for event in model.trajectory() {
        match &event.cell {
            warden_core::event::Cell::File(identity) => {
                assert_eq!(identity.content_digest, zero);
            },
            other => panic!("expected a file cell, got {other:?}"),
        }
        assert_eq!(*event.coefficient(), first);
    }
}

#[test]
fn loaded_points_seed_a_sealed_domain() {
    let engine = test_engine();
    let reference = internal_domain(&engine);
    let task = test_task(6);
    let file = MemoryFile::new("/usr/bin/approved", b"approved binary");

    open_file(&engine, &reference, &task, &file);
    let approved = *reference.model().unwrap().trajectory()[0].coefficient();

    let enforcing = internal_domain(&engine);
    enforcing.load_point(approved).unwrap();
    enforcing.seal();

    let runner = test_task(7);
    open_file(&engine, &enforcing, &runner, &file);
    assert_eq!(runner.trust_status(), TrustStatus::Trusted);

    let rogue = MemoryFile::new("/usr/bin/rogue", b"rogue binary");
    open_file(&engine, &enforcing, &runner, &rogue);
    assert_eq!(runner.trust_status(), TrustStatus::Untrusted);
    assert_eq!(enforcing.model().unwrap().forensics().len(), 1);
}

#[test]
fn measurement_matches_manual_fold() {
    let engine = test_engine();
    let domain = internal_domain(&engine);
    let task = test_task(8);
    let alg = domain.algorithm();

    let base = alg.digest(b"deployment base");
    domain.load_base(base).unwrap();

    let files = [
        MemoryFile::new("/bin/a", b"aa"),
        MemoryFile::new("/bin/b", b"bb"),
        MemoryFile::new("/bin/c", b"cc"),
    ];
    for file in &files {
        open_file(&engine, &domain, &task, file);
    }

    let model = domain.model().unwrap();
    // Replays from the start of the domain: the aggregate injected at
    // creation, then each admitted coefficient, all domain separated by
    // the base in effect when they were folded.
    let mut expected = Digest::zeroed(alg.digest_size());
    let mut fold = |expected: &mut Digest, base: &Digest, point: &Digest| {
        let mut host = alg.context();
        host.update(base.as_bytes());
        let host = host.finup(point.as_bytes());
        let mut cx = alg.context();
        cx.update(expected.as_bytes());
        *expected = cx.finup(host.as_bytes());
    };

    let zero_base = Digest::zeroed(alg.digest_size());
    let aggregate = engine.trust().aggregate(alg);
    fold(&mut expected, &zero_base, &aggregate);
    for event in model.trajectory() {
        fold(&mut expected, &base, event.coefficient());
    }

    assert_eq!(model.measurement(), expected);
}

#[test]
fn distinct_tasks_yield_distinct_coefficients() {
    let engine = test_engine();
    let domain = internal_domain(&engine);

    let shell = MemoryFile::new("/bin/sh", b"shell image");
    let task_a = test_task(10);
    let task_b = test_task(11);
    engine.derive_task_id(&domain, &task_a, &shell).unwrap();
    let editor = MemoryFile::new("/bin/ed", b"editor image");
    engine.derive_task_id(&domain, &task_b, &editor).unwrap();
    assert_ne!(task_a.task_id(), task_b.task_id());

    let file = MemoryFile::new("/tmp/shared", b"shared");
    open_file(&engine, &domain, &task_a, &file);
    open_file(&engine, &domain, &task_b, &file);

    // Same file, same credentials, different task identities.
    assert_eq!(domain.model().unwrap().points().len(), 2);
}

#[test]
fn synchronous_export_rendezvous_resolves() {
    let engine = Arc::new(test_engine());
    let domain = external_domain(&engine, "ab");
    let task = test_task(12);

    let exporter_engine = Arc::clone(&engine);
    let exporter_domain = Arc::clone(&domain);
    let exporter_task = Arc::clone(&task);
    let handle = thread::spawn(move || {
        let file = MemoryFile::new("/tmp/exported", b"payload");
        exporter_engine.handle_hook(
            &exporter_domain,
            &exporter_task,
            EventKind::FileOpen,
            EventParams::File { file: &file },
            false,
        )
    });

    let external = domain.external().unwrap();
    assert!(external.wait_for_export(Duration::from_secs(5)));

    let deadline = Instant::now() + Duration::from_secs(5);
    while task.trust_status() != TrustStatus::TrustPending {
        assert!(Instant::now() < deadline, "caller never parked");
        thread::yield_now();
    }

    task.resolve_trust(true);
    assert!(handle.join().unwrap().is_ok());
    assert_eq!(task.trust_status(), TrustStatus::Trusted);

    // Aggregate first, then the synchronous event.
    let aggregate = external.show().unwrap();
    assert!(aggregate.contains("\"type\":\"aggregate\""));
    let event = external.show().unwrap();
    assert!(event.contains("\"type\":\"event\""));
    assert!(event.contains("\"pathname\":\"/tmp/exported\""));
}

#[test]
fn killed_sync_exporter_is_untrusted_and_record_survives() {
    let engine = Arc::new(test_engine());
    let domain = external_domain(&engine, "cd");
    let task = test_task(13);

    let exporter_engine = Arc::clone(&engine);
    let exporter_domain = Arc::clone(&domain);
    let exporter_task = Arc::clone(&task);
    let handle = thread::spawn(move || {
        let file = MemoryFile::new("/tmp/doomed", b"payload");
        exporter_engine.handle_hook(
            &exporter_domain,
            &exporter_task,
            EventKind::FileOpen,
            EventParams::File { file: &file },
            false,
        )
    });

    let external = domain.external().unwrap();
    assert!(external.wait_for_export(Duration::from_secs(5)));
    let deadline = Instant::now() + Duration::from_secs(5);
    while task.trust_status() != TrustStatus::TrustPending {
        assert!(Instant::now() < deadline, "caller never parked");
        thread::yield_now();
    }

    task.deliver_fatal_signal();
    let result = handle.join().unwrap();
    assert!(matches!(
        result,
        Err(warden_core::EngineError::Cancelled)
    ));
    assert_eq!(task.trust_status(), TrustStatus::Untrusted);

    // Both the aggregate and the event survive in the queue.
    assert_eq!(external.pending(), 2);
}

#[test]
fn async_export_preserves_order_and_does_not_block() {
    let engine = test_engine();
    let domain = external_domain(&engine, "ef");
    let task = test_task(14);

    for port in [80u16, 443, 8080] {
        engine
            .handle_hook(
                &domain,
                &task,
                EventKind::SocketConnect,
                EventParams::SocketConnect {
                    addr: warden_core::event::RawSocketAddress::ipv4(port, [127, 0, 0, 1]),
                },
                true,
            )
            .unwrap();
    }
    assert_eq!(task.trust_status(), TrustStatus::Trusted);

    let external = domain.external().unwrap();
    let _aggregate = external.show().unwrap();
    for port in [80u64, 443, 8080] {
        let line = external.show().unwrap();
        assert!(line.contains("\"type\":\"async_event\""), "line: {line}");
        assert!(line.contains(&format!("\"port\":{port}")), "line: {line}");
    }
}

#[test]
fn domains_do_not_share_state() {
    let engine = test_engine();
    let loud = internal_domain(&engine);
    let quiet = internal_domain(&engine);
    let task = test_task(15);

    let file = MemoryFile::new("/tmp/only-loud", b"data");
    open_file(&engine, &loud, &task, &file);

    assert_eq!(loud.model().unwrap().trajectory().len(), 1);
    assert!(quiet.model().unwrap().trajectory().is_empty());

    // Identical coefficients land in both domains without interference.
    open_file(&engine, &quiet, &task, &file);
    assert_eq!(quiet.model().unwrap().trajectory().len(), 1);
}
