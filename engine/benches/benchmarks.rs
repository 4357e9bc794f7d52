//! Performance benchmarks for ward-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use ward_engine::{
    Association, AssociationKind, ChannelRouter, EntityType, ExportPlan, ExportQuery, FieldDef,
    FieldType, ImportPlan, Schema, ScopeRule, SnapshotBuilder, SnapshotRequest, Store,
    SyncConfig, SyncRecord, INITIAL_SYNC_TICK,
};

fn create_test_schema() -> Schema {
    Schema::new(1)
        .with_entity(EntityType::new(
            "patient",
            vec![
                FieldDef::required("displayName", FieldType::String),
                FieldDef::optional("email", FieldType::String),
            ],
        ))
        .with_entity(
            EntityType::new("encounter", vec![])
                .scoped(ScopeRule::patient("patientId"))
                .association(Association::new(
                    "diagnoses",
                    "diagnosis",
                    "encounterId",
                    AssociationKind::TravelsWithParent,
                )),
        )
        .with_entity(EntityType::new("diagnosis", vec![]))
}

fn populated_store(size: usize) -> Store {
    let store = Store::new(create_test_schema());
    for i in 0..size {
        let patient = format!("p_{}", i % 50);
        let fields = json!({"displayName": format!("Patient {}", i % 50)});
        let _ = store.insert("patient", patient.clone(), fields.as_object().cloned().unwrap_or_default());

        let fields = json!({"patientId": patient, "reason": "checkup"});
        let _ = store.insert(
            "encounter",
            format!("e_{}", i),
            fields.as_object().cloned().unwrap_or_default(),
        );
        let fields = json!({"encounterId": format!("e_{}", i), "code": "Z00"});
        let _ = store.insert(
            "diagnosis",
            format!("d_{}", i),
            fields.as_object().cloned().unwrap_or_default(),
        );
    }
    store
}

fn bench_store_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_operations");

    group.bench_function("insert", |b| {
        let store = Store::new(create_test_schema());
        let mut id = 0u64;
        let fields = json!({"displayName": "Test"}).as_object().cloned().unwrap_or_default();

        b.iter(|| {
            id += 1;
            store.insert(black_box("patient"), format!("p_{}", id), fields.clone())
        })
    });

    group.bench_function("get_record", |b| {
        let store = populated_store(1000);
        b.iter(|| store.get(black_box("encounter"), black_box("e_500")))
    });

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");

    for size in [100, 500, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("build", size), size, |b, &size| {
            let store = populated_store(size);
            let builder = SnapshotBuilder::new(store.schema(), &SyncConfig::default());
            let request = SnapshotRequest::new(Default::default(), INITIAL_SYNC_TICK)
                .entity_types(["patient", "encounter", "diagnosis"])
                .patients((0..10).map(|i| format!("p_{}", i)));

            b.iter(|| builder.build(&store.begin_read(), black_box(&request)))
        });
    }

    group.finish();
}

fn bench_plans(c: &mut Criterion) {
    let mut group = c.benchmark_group("plans");

    for size in [100, 500, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("export_all_pages", size), size, |b, &size| {
            let store = populated_store(size);
            let router = ChannelRouter::new(store.schema());
            let plan = ExportPlan::compile(store.schema(), router.resolve("encounter").unwrap()).unwrap();

            b.iter(|| {
                let mut cursor = None;
                let mut total = 0;
                loop {
                    let page = plan
                        .execute(&store, &ExportQuery::default().cursor(cursor))
                        .unwrap();
                    total += page.records.len();
                    match page.next_cursor {
                        Some(next) => cursor = Some(next),
                        None => break total,
                    }
                }
            })
        });

        group.bench_with_input(BenchmarkId::new("import_batch", size), size, |b, &size| {
            let source = populated_store(size);
            let router = ChannelRouter::new(source.schema());
            let channel = router.resolve("encounter").unwrap();
            let export = ExportPlan::compile(source.schema(), channel.clone()).unwrap();
            let import = ImportPlan::compile(source.schema(), channel).unwrap();
            let records: Vec<SyncRecord> = export
                .execute(&source, &ExportQuery::default().limit(size))
                .unwrap()
                .records;
            let config = SyncConfig::default();

            b.iter(|| {
                let target = Store::new(create_test_schema());
                import.execute(&target, black_box(&records), &config, 1000)
            })
        });
    }

    group.finish();
}

fn bench_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialization");

    group.bench_function("record_to_json", |b| {
        let record = SyncRecord::new(
            json!({
                "id": "e_1",
                "patientId": "p_1",
                "diagnoses": [{"data": {"id": "d_1", "code": "Z00"}}],
            })
            .as_object()
            .cloned()
            .unwrap_or_default(),
        );

        b.iter(|| serde_json::to_string(black_box(&record)))
    });

    group.bench_function("record_from_json", |b| {
        let json = r#"{"data":{"id":"e_1","patientId":"p_1","diagnoses":[{"data":{"id":"d_1"}}]}}"#;

        b.iter(|| serde_json::from_str::<SyncRecord>(black_box(json)))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_store_operations,
    bench_snapshot,
    bench_plans,
    bench_serialization,
);
criterion_main!(benches);
