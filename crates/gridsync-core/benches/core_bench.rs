//! Criterion benchmarks for gridsync-core.
//!
//! ## Benchmark groups
//!
//! 1. **ldap_filter**: Filter parsing and matching against LDIF records.
//! 2. **changeset**: Staging and append resolution on a populated store.
//! 3. **reconcile**: Full runs of the driver over the bundled BDII fixture.
//!
//! ## Running
//!
//! ```sh
//! cargo bench --manifest-path crates/gridsync-core/Cargo.toml
//! # Run only the reconcile group:
//! cargo bench --manifest-path crates/gridsync-core/Cargo.toml -- reconcile
//! ```

use chrono::NaiveDate;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use gridsync_core::changeset::ChangeSet;
use gridsync_core::config::SyncConfig;
use gridsync_core::driver::ReconciliationDriver;
use gridsync_core::source::filter::LdapFilter;
use gridsync_core::source::{parse_ldif, LdifDirectory};
use gridsync_core::store::MemoryConfigStore;

const BDII: &str = include_str!("../testdata/bdii_site.ldif");

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 18).unwrap()
}

fn config() -> SyncConfig {
    SyncConfig {
        vos: vec!["lhcb".into(), "atlas".into()],
        ..SyncConfig::default()
    }
}

/// A CS with `n` sites of four CEs each, all seen recently.
fn populated_store(n: usize) -> MemoryConfigStore {
    let mut options = Vec::new();
    for i in 0..n {
        let site = format!("/Resources/Sites/LCG/LCG.BENCH-{i}.uk");
        let hosts: Vec<String> = (0..4).map(|c| format!("ce{c}.s{i}.ac.uk")).collect();
        options.push((format!("{site}/CE"), hosts.join(", ")));
        for host in &hosts {
            options.push((format!("{site}/CEs/{host}/LastSeen"), "17/10/2026".to_string()));
            options.push((format!("{site}/CEs/{host}/CEType"), "HTCondorCE".to_string()));
        }
    }
    MemoryConfigStore::with_options(options)
}

// ---------------------------------------------------------------------------
// 1. LDAP filters
// ---------------------------------------------------------------------------

fn bench_ldap_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("ldap_filter");
    let filter = "(&(objectClass=GlueCE)(|(GlueCEAccessControlBaseRule=VO:lhcb)\
                  (GlueCEAccessControlBaseRule=VOMS:/lhcb/*)))";

    group.bench_function("parse", |b| {
        b.iter(|| LdapFilter::parse(black_box(filter)).unwrap());
    });

    let records = parse_ldif(BDII).unwrap();
    let parsed = LdapFilter::parse(filter).unwrap();
    group.bench_function("match_fixture", |b| {
        b.iter(|| {
            black_box(records.iter().filter(|r| parsed.matches(r)).count());
        });
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// 2. Change sets
// ---------------------------------------------------------------------------

fn bench_changeset(c: &mut Criterion) {
    let mut group = c.benchmark_group("changeset");

    for &sites in &[10usize, 100] {
        group.bench_with_input(BenchmarkId::new("append_resolution", sites), &sites, |b, &n| {
            b.iter_with_setup(
                || populated_store(n),
                |mut store| {
                    let mut changes = ChangeSet::new(&mut store);
                    for i in 0..n {
                        let site = format!("/Resources/Sites/LCG/LCG.BENCH-{i}.uk");
                        changes.append_unique(&site, "CE", &format!("ce9.s{i}.ac.uk"));
                        changes
                            .add(&format!("{site}/CEs/ce0.s{i}.ac.uk"), "LastSeen", "18/10/2026")
                            .unwrap();
                    }
                    black_box(changes.commit().unwrap());
                },
            );
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// 3. Full reconciliation
// ---------------------------------------------------------------------------

fn bench_reconcile(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile");
    let config = config();
    let directory = LdifDirectory::from_ldif(BDII).unwrap();

    group.bench_function("first_run", |b| {
        b.iter_with_setup(MemoryConfigStore::new, |mut store| {
            let report = ReconciliationDriver::new(&config, &directory)
                .at(today())
                .run(&mut store);
            black_box(report);
        });
    });

    group.bench_function("noop_run", |b| {
        b.iter_with_setup(
            || {
                let mut store = MemoryConfigStore::new();
                ReconciliationDriver::new(&config, &directory)
                    .at(today())
                    .run(&mut store);
                store
            },
            |mut store| {
                let report = ReconciliationDriver::new(&config, &directory)
                    .at(today())
                    .run(&mut store);
                black_box(report);
            },
        );
    });

    group.finish();
}

criterion_group!(benches, bench_ldap_filter, bench_changeset, bench_reconcile);
criterion_main!(benches);
