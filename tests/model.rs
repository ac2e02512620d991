use std::collections::HashSet;

use num_bigint::BigUint;
use test_log::test;

use inverse_model::engine::{EngineConfig, PredicateEngine};
use inverse_model::error::Error;
use inverse_model::model::InverseModel;
use inverse_model::ports::PortVectorRegistry;
use inverse_model::predicate::Predicate;
use inverse_model::rule::{DeviceId, Port, Rule, SourceMatch};

fn engine() -> PredicateEngine {
    PredicateEngine::new(EngineConfig::default().with_storage_bits(16))
}

fn port_names(model: &InverseModel, p: &Predicate) -> Vec<String> {
    let vector = model.vector_of(p).unwrap().expect("predicate spans several ECs");
    model
        .registry()
        .members(vector)
        .iter()
        .map(|port| port.to_string())
        .collect()
}

fn assert_partition(model: &InverseModel) {
    assert!(model.verify_partition().unwrap());

    let engine = model.engine();
    let total: BigUint = model
        .current_partition()
        .iter()
        .map(|(p, _)| engine.sat_count(p))
        .sum();
    assert_eq!(total, BigUint::from(1u32) << engine.num_vars());
}

#[test]
fn test_ten_slash_eight_scenario() {
    let engine = engine();
    let d = DeviceId::new(0);
    let mut model = InverseModel::new(engine.clone(), [d]);

    let rule = Rule::ipv4(d, [10, 0, 0, 0], 8, 10, Port::new(d, "eth1"));
    let ten = engine.encode(rule.dst(), 8, None).unwrap();

    let moved = model.insert_rules(&[rule.clone()]).unwrap();
    assert_eq!(moved, HashSet::from([ten.clone()]));
    assert_eq!(model.ec_count(), 2);
    assert_eq!(port_names(&model, &ten), ["d0:eth1"]);
    assert_eq!(port_names(&model, &engine.not(&ten)), ["d0:default"]);
    assert_partition(&model);

    let moved = model.delete_rules(&[rule]).unwrap();
    assert_eq!(moved, HashSet::from([ten]));
    assert_eq!(model.ec_count(), 1);
    let partition = model.current_partition();
    assert!(partition[0].0.is_true());
    assert_eq!(port_names(&model, &engine.one()), ["d0:default"]);
}

#[test]
fn test_empty_batch_is_identity() {
    let d = DeviceId::new(0);
    let mut model = InverseModel::new(engine(), [d]);
    model
        .insert_rules(&[
            Rule::ipv4(d, [10, 0, 0, 0], 8, 1, Port::new(d, "a")),
            Rule::ipv4(d, [10, 1, 0, 0], 16, 2, Port::new(d, "b")),
        ])
        .unwrap();

    let before = model.current_partition();
    let moved = model.apply_batch(&[], &[]).unwrap();
    assert!(moved.is_empty());
    assert_eq!(model.current_partition(), before);
    assert_partition(&model);
}

#[test]
fn test_cancelled_rule_changes_nothing() {
    let d = DeviceId::new(0);
    let mut model = InverseModel::new(engine(), [d]);
    let rule = Rule::ipv4(d, [192, 168, 0, 0], 16, 5, Port::new(d, "lan"));

    let before = model.current_partition();
    let moved = model.apply_batch(&[rule.clone()], &[rule.clone()]).unwrap();
    assert!(moved.is_empty());
    assert_eq!(model.current_partition(), before);
    assert!(model.rule_predicate(&rule).is_none());
}

#[test]
fn test_duplicate_and_repeated_insertions() {
    let d = DeviceId::new(0);
    let mut model = InverseModel::new(engine(), [d]);
    let rule = Rule::ipv4(d, [172, 16, 0, 0], 12, 5, Port::new(d, "vpn"));

    model.insert_rules(&[rule.clone(), rule.clone()]).unwrap();
    assert_eq!(model.rule_count(), 2);
    assert_eq!(model.last_update().raw_changes, 1);

    let before = model.current_partition();
    assert!(model.insert_rules(&[rule.clone()]).unwrap().is_empty());
    assert_eq!(model.current_partition(), before);

    // Deleting a rule that is not installed is a no-op too.
    let unknown = Rule::ipv4(d, [172, 16, 0, 0], 12, 6, Port::new(d, "vpn"));
    assert!(model.delete_rules(&[unknown]).unwrap().is_empty());
    assert_eq!(model.rule_count(), 2);
}

#[test]
fn test_priority_shadowing() {
    let engine = engine();
    let d = DeviceId::new(0);
    let mut model = InverseModel::new(engine.clone(), [d]);

    let p1 = Rule::ipv4(d, [10, 0, 0, 0], 8, 10, Port::new(d, "p1"));
    let p2 = Rule::ipv4(d, [10, 0, 0, 0], 8, 5, Port::new(d, "p2"));
    let ten = engine.encode(p1.dst(), 8, None).unwrap();

    model.insert_rules(&[p1.clone(), p2.clone()]).unwrap();
    assert_eq!(port_names(&model, &ten), ["d0:p1"]);

    // The shadowed rule changes nothing.
    assert!(model.delete_rules(&[p2.clone()]).unwrap().is_empty());
    assert_eq!(port_names(&model, &ten), ["d0:p1"]);

    model.insert_rules(&[p2]).unwrap();
    let changes = model.compute_changes(&[], &[p1]).unwrap();
    assert_eq!(changes.raw_len(), 1);
    assert_eq!(changes.first_stage_len(), 1);
    assert_eq!(changes.get(&Port::new(d, "p2")), Some(&ten));
    let moved = model.update(changes).unwrap();
    assert_eq!(model.last_update().raw_changes, 1);
    assert_eq!(moved, HashSet::from([ten.clone()]));
    assert_eq!(port_names(&model, &ten), ["d0:p2"]);
    assert_partition(&model);
}

#[test]
fn test_multi_device_port_vectors() {
    let engine = engine();
    let devices: Vec<_> = (0..3).map(DeviceId::new).collect();
    let mut model = InverseModel::new(engine.clone(), devices.clone());

    // Every device routes 10/8 somewhere; device 1 also splits 10.1/16.
    let mut rules: Vec<Rule> = devices
        .iter()
        .map(|&d| Rule::ipv4(d, [10, 0, 0, 0], 8, 1, Port::new(d, "core")))
        .collect();
    rules.push(Rule::ipv4(devices[1], [10, 1, 0, 0], 16, 2, Port::new(devices[1], "edge")));
    model.insert_rules(&rules).unwrap();
    assert_partition(&model);
    assert_eq!(model.ec_count(), 3);

    let ten_one = engine.encode(&BigUint::from(0x0a01_0000u32), 16, None).unwrap();
    assert_eq!(port_names(&model, &ten_one), ["d0:core", "d1:edge", "d2:core"]);

    let ten = engine.encode(&BigUint::from(0x0a00_0000u32), 8, None).unwrap();
    let ten_rest = engine.diff(&ten, &ten_one).unwrap();
    assert_eq!(port_names(&model, &ten_rest), ["d0:core", "d1:core", "d2:core"]);

    // Moving one device back to default splits nothing new.
    model.delete_rules(&rules[2..3]).unwrap();
    assert_partition(&model);
    assert_eq!(port_names(&model, &ten_rest), ["d0:core", "d1:core", "d2:default"]);
    assert_eq!(model.ec_count(), 3);
}

#[test]
fn test_source_matches() {
    let engine = engine();
    let d = DeviceId::new(0);
    let mut model = InverseModel::new(engine.clone(), [d]);

    let even = Rule::ipv4(d, [10, 0, 0, 0], 8, 3, Port::new(d, "even"))
        .with_source(SourceMatch::new(0, 1));
    let odd = Rule::ipv4(d, [10, 0, 0, 0], 8, 3, Port::new(d, "odd"))
        .with_source(SourceMatch::new(1, 1));
    model.insert_rules(&[even.clone(), odd]).unwrap();
    assert_eq!(model.ec_count(), 3);
    assert_partition(&model);

    let p = engine.encode(even.dst(), 8, even.source()).unwrap();
    assert_eq!(port_names(&model, &p), ["d0:even"]);
}

#[test]
fn test_churn_keeps_partition() {
    let d0 = DeviceId::new(0);
    let d1 = DeviceId::new(1);
    let mut model = InverseModel::new(engine(), [d0, d1]);

    let rules: Vec<Rule> = (0..16u8)
        .map(|i| {
            let d = if i % 2 == 0 { d0 } else { d1 };
            let len = 4 + u32::from(i % 4) * 4;
            let name = format!("p{}", i % 3);
            Rule::ipv4(d, [i << 4, i, 0, 0], len, i32::from(i % 5), Port::new(d, name))
        })
        .collect();

    for chunk in rules.chunks(3) {
        model.insert_rules(chunk).unwrap();
        assert_partition(&model);
    }
    for (i, chunk) in rules.chunks(5).enumerate() {
        let readd: Vec<Rule> = rules.iter().skip(i).step_by(7).cloned().collect();
        model.apply_batch(&readd, chunk).unwrap();
        assert_partition(&model);
    }
    model.delete_rules(&rules).unwrap();
    assert_partition(&model);
    assert_eq!(model.ec_count(), 1);
    assert_eq!(model.rule_count(), 2);
}

#[test]
fn test_reference_counts_are_restored() {
    let engine = engine();
    let d = DeviceId::new(0);
    let mut model = InverseModel::new(engine.clone(), [d]);

    // Warm the encoder so its memoized tries are already populated.
    let rules = [
        Rule::ipv4(d, [10, 0, 0, 0], 8, 1, Port::new(d, "a")),
        Rule::ipv4(d, [10, 2, 0, 0], 16, 2, Port::new(d, "b")),
        Rule::ipv4(d, [10, 2, 3, 0], 24, 3, Port::new(d, "c")),
    ];
    model.insert_rules(&rules).unwrap();
    model.delete_rules(&rules).unwrap();
    engine.collect_garbage();
    let live = engine.stats().live_nodes;

    model.insert_rules(&rules).unwrap();
    model.delete_rules(&rules).unwrap();
    engine.collect_garbage();
    assert_eq!(engine.stats().live_nodes, live);

    let encoded: Vec<Predicate> = rules
        .iter()
        .map(|r| engine.encode(r.dst(), r.prefix_len(), None).unwrap())
        .collect();
    let counts: Vec<u32> = encoded.iter().map(|p| engine.ref_count(p)).collect();
    model.insert_rules(&rules).unwrap();
    model.delete_rules(&rules).unwrap();
    let after: Vec<u32> = encoded.iter().map(|p| engine.ref_count(p)).collect();
    assert_eq!(counts, after);
}

#[test]
fn test_batch_validation() {
    let engine = engine();
    let d0 = DeviceId::new(0);
    let d1 = DeviceId::new(1);
    let mut model = InverseModel::new(engine, [d0, d1]);

    let good = Rule::ipv4(d0, [10, 0, 0, 0], 8, 10, Port::new(d0, "eth1"));
    let foreign = Rule::ipv4(d0, [10, 0, 0, 0], 8, 10, Port::new(d1, "x"));
    assert!(matches!(
        model.insert_rules(&[good.clone(), foreign]),
        Err(Error::ForeignPort { .. })
    ));
    assert_eq!(model.ec_count(), 1);

    // Deletions the model never tracked do not block the insertions.
    let untracked = [
        Rule::ipv4(DeviceId::new(5), [10, 0, 0, 0], 8, 1, Port::new(DeviceId::new(5), "y")),
        Rule::new(d0, 0u32, 40, 1, Port::new(d0, "z")),
    ];
    model.apply_batch(&[good.clone()], &untracked).unwrap();
    assert!(model.rule_predicate(&good).is_some());
    assert_eq!(model.ec_count(), 2);
    assert_partition(&model);
}
