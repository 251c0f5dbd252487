//! Entity lifecycle: add/remove, deletion, references, resurrection.

use crate::comp::{Capacity, ComponentDef, FieldKind, StorageKind, Value};
use crate::error::{CheckError, Error};
use crate::system::SystemDef;
use crate::test_util::{init_logger, ScriptSystem, Shared};
use crate::world::{World, WorldOptions};

fn relaxed() -> WorldOptions { WorldOptions { relax_state_checks: true, ..Default::default() } }

#[test]
fn add_remove_shape_roundtrip() {
    init_logger();

    let mut builder = World::builder();
    let data = builder
        .register_component(ComponentDef::new("Data").field_default("value", FieldKind::U8))
        .unwrap();
    let mut world = builder.build().unwrap();

    let entity = world.create_entity(&[]).unwrap();
    assert!(!world.has(entity, data).unwrap());

    world.add(entity, data, &[("value", Value::U8(3))]).unwrap();
    assert!(world.has(entity, data).unwrap());
    let err = world.add(entity, data, &[]).unwrap_err();
    assert!(matches!(err, Error::Check(CheckError::AlreadyPresent { .. })));

    world.remove(entity, data).unwrap();
    assert!(!world.has(entity, data).unwrap());
    let err = world.remove(entity, data).unwrap_err();
    assert!(matches!(err, Error::Check(CheckError::NotPresent { .. })));
}

#[test]
fn write_then_read_is_exact() {
    init_logger();

    let mut builder = World::builder();
    let mix = builder
        .register_component(
            ComponentDef::new("Mix")
                .field_default("f", FieldKind::F64)
                .field_default("i", FieldKind::I32)
                .field_default("u", FieldKind::U64)
                .field_default("b", FieldKind::Bool),
        )
        .unwrap();
    let mut world = builder.build().unwrap();
    let entity = world.create_entity(&[(mix, &[])]).unwrap();

    {
        let mut view = world.write(entity, mix).unwrap();
        view.set("f", Value::F64(-0.125)).unwrap();
        view.set("i", Value::I32(-7)).unwrap();
        view.set("u", Value::U64(0xDEAD_BEEF_CAFE_F00D)).unwrap();
        view.set("b", Value::Bool(true)).unwrap();
    }

    let view = world.read(entity, mix).unwrap();
    assert_eq!(view.get("f").unwrap(), Value::F64(-0.125));
    assert_eq!(view.get("i").unwrap(), Value::I32(-7));
    assert_eq!(view.get("u").unwrap(), Value::U64(0xDEAD_BEEF_CAFE_F00D));
    assert_eq!(view.get("b").unwrap(), Value::Bool(true));

    let err = view.get("nope").unwrap_err();
    assert!(matches!(err, Error::Check(CheckError::UnknownField { .. })));
}

#[test]
fn create_entity_matches_sequential_adds() {
    init_logger();

    let mut builder = World::builder();
    let x = builder
        .register_component(ComponentDef::new("X").field("v", FieldKind::I16, Value::I16(9)))
        .unwrap();
    let y = builder.register_component(ComponentDef::new("Y")).unwrap();
    let mut world = builder.build().unwrap();

    let batch = world.create_entity(&[(x, &[]), (y, &[])]).unwrap();
    let manual = world.create_entity(&[]).unwrap();
    world.add(manual, x, &[]).unwrap();
    world.add(manual, y, &[]).unwrap();

    for entity in [batch, manual] {
        assert!(world.has_all_of(entity, &[x, y]).unwrap());
        assert_eq!(world.count_has(entity, &[x, y]).unwrap(), 2);
        assert_eq!(world.read(entity, x).unwrap().get("v").unwrap(), Value::I16(9));
    }
}

#[test]
fn deleting_a_target_nulls_inbound_refs() {
    init_logger();

    let mut builder = World::builder();
    let holder = builder
        .register_component(ComponentDef::new("Holder").ref_field("target"))
        .unwrap();
    let mut world = builder.build().unwrap();

    let target = world.create_entity(&[]).unwrap();
    let source = world
        .create_entity(&[(holder, &[("target", Value::Ref(Some(target)))])])
        .unwrap();
    assert_eq!(
        world.read(source, holder).unwrap().entity_ref("target").unwrap(),
        Some(target),
    );

    world.delete(target).unwrap();
    world.execute().unwrap();

    assert!(!world.is_alive(target));
    assert_eq!(world.read(source, holder).unwrap().entity_ref("target").unwrap(), None);
}

#[test]
fn removing_a_component_clears_its_outbound_refs() {
    init_logger();

    let mut builder = World::builder();
    let holder = builder
        .register_component(ComponentDef::new("Holder").ref_field("target"))
        .unwrap();
    let mut world = builder.build().unwrap();

    let target = world.create_entity(&[]).unwrap();
    let source = world
        .create_entity(&[(holder, &[("target", Value::Ref(Some(target)))])])
        .unwrap();
    assert_eq!(world.refs.inbound_count(target), 1);

    world.remove(source, holder).unwrap();
    assert_eq!(world.refs.inbound_count(target), 0);

    // deleting the old target later must not touch the source
    world.delete(target).unwrap();
    world.execute().unwrap();
    assert!(world.is_alive(source));
}

#[test]
fn stale_handles_are_rejected_after_the_flush() {
    init_logger();

    let mut builder = World::builder();
    let data = builder.register_component(ComponentDef::new("Data")).unwrap();
    let mut world = builder.build().unwrap();

    let entity = world.create_entity(&[(data, &[])]).unwrap();
    world.delete(entity).unwrap();
    world.execute().unwrap();

    assert!(!world.is_alive(entity));
    assert!(matches!(
        world.has(entity, data),
        Err(Error::Check(CheckError::StaleEntity { .. }))
    ));
}

#[test]
fn held_ids_are_not_recycled() {
    init_logger();

    let builder = World::builder_with(WorldOptions {
        max_entities: 2,
        relax_state_checks: true,
        ..Default::default()
    });
    let mut world = builder.build().unwrap();

    let held = world.create_entity(&[]).unwrap();
    world.hold(held).unwrap();
    world.delete(held).unwrap();
    world.execute().unwrap();
    world.execute().unwrap(); // the dead id passes through its grace frame

    // one id is parked by the hold, the other stays allocatable
    let other = world.create_entity(&[]).unwrap();
    assert_ne!(other.id(), held.id());
    assert!(matches!(
        world.create_entity(&[]),
        Err(Error::Check(CheckError::CapacityExhausted { .. }))
    ));

    world.unhold(held);
    let recycled = world.create_entity(&[]).unwrap();
    assert_eq!(recycled.id(), held.id());
    assert!(!world.is_alive(held));
}

#[test]
fn fixed_capacity_storage_exhausts() {
    init_logger();

    let mut builder = World::builder();
    let rare = builder
        .register_component(
            ComponentDef::new("Rare")
                .storage(StorageKind::Packed)
                .capacity(Capacity::Fixed(1))
                .field_default("v", FieldKind::U8),
        )
        .unwrap();
    let mut world = builder.build().unwrap();

    world.create_entity(&[(rare, &[])]).unwrap();
    let err = world.create_entity(&[(rare, &[])]).unwrap_err();
    assert!(matches!(err, Error::Check(CheckError::CapacityExhausted { .. })));
}

#[test]
fn create_entity_requires_setup_state() {
    init_logger();

    let mut world = World::builder().build().unwrap();
    world.execute().unwrap();

    assert!(matches!(
        world.create_entity(&[]),
        Err(Error::Check(CheckError::WrongState { .. }))
    ));

    // the relaxed option lifts the restriction for tests
    let mut world = World::builder_with(relaxed()).build().unwrap();
    world.execute().unwrap();
    world.create_entity(&[]).unwrap();
}

#[test]
fn resurrection_window_preserves_the_slot() {
    init_logger();

    let mut builder = World::builder_with(relaxed());
    let b = builder
        .register_component(ComponentDef::new("B").field_default("value", FieldKind::U8))
        .unwrap();

    let entity_slot: Shared<crate::entity::Entity> = Shared::default();
    let entity_captured = entity_slot.clone();
    let observed: Shared<u8> = Shared::default();
    let observed_captured = observed.clone();
    let frame4_failed: Shared<bool> = Shared::default();
    let frame4_captured = frame4_failed.clone();
    let recent: Shared<bool> = Shared::default();
    let recent_captured = recent.clone();

    let mut frame = 0u32;
    builder
        .register_system(SystemDef::new(
            "Churn",
            ScriptSystem::new(
                move |decl| {
                    // split entitlements over two queries: writes, and an
                    // opt-in for recently-deleted reads
                    decl.query().writes(&[b]).build();
                    if recent_captured.get() {
                        decl.query().reads(&[b]).access_recently_deleted().build();
                    }
                },
                move |cx| {
                    let entity = entity_captured.get();
                    frame += 1;
                    match frame {
                        1 => {
                            cx.add(entity, b, &[("value", Value::U8(1))])?;
                            cx.remove(entity, b)?;
                        }
                        2 => {
                            cx.add(entity, b, &[("value", Value::U8(2))])?;
                            cx.remove(entity, b)?;
                        }
                        3 => {
                            let view = cx.read(entity, b)?;
                            let value = view.get("value")?.as_i64().expect("integer field");
                            observed_captured.set(value as u8);
                        }
                        _ => {
                            if cx.read(entity, b).is_err() {
                                frame4_captured.set(true);
                            }
                        }
                    }
                    Ok(())
                },
            ),
        ))
        .unwrap();

    recent.set(true);
    let mut world = builder.build().unwrap();
    let entity = world.create_entity(&[]).unwrap();
    entity_slot.set(entity);

    for _ in 0..4 {
        world.execute().unwrap();
    }
    assert_eq!(observed.try_get(), Some(2), "recently-deleted read sees the last written value");
    assert_eq!(frame4_failed.try_get(), Some(true), "the slot is gone after the sweep");
}

#[test]
fn recently_deleted_read_requires_the_opt_in() {
    init_logger();

    let mut builder = World::builder_with(relaxed());
    let b = builder
        .register_component(ComponentDef::new("B").field_default("value", FieldKind::U8))
        .unwrap();

    let entity_slot: Shared<crate::entity::Entity> = Shared::default();
    let entity_captured = entity_slot.clone();
    let denied: Shared<bool> = Shared::default();
    let denied_captured = denied.clone();

    let mut frame = 0u32;
    builder
        .register_system(SystemDef::new(
            "NoOptIn",
            ScriptSystem::new(
                move |decl| {
                    decl.query().writes(&[b]).build();
                },
                move |cx| {
                    let entity = entity_captured.get();
                    frame += 1;
                    match frame {
                        1 => {
                            cx.add(entity, b, &[("value", Value::U8(7))])?;
                            cx.remove(entity, b)?;
                        }
                        _ => {
                            // without the opt-in the limbo slot is invisible
                            if matches!(
                                cx.read(entity, b),
                                Err(Error::Check(CheckError::NotPresent { .. }))
                            ) {
                                denied_captured.set(true);
                            }
                        }
                    }
                    Ok(())
                },
            ),
        ))
        .unwrap();

    let mut world = builder.build().unwrap();
    let entity = world.create_entity(&[]).unwrap();
    entity_slot.set(entity);

    world.execute().unwrap();
    world.execute().unwrap();
    assert_eq!(denied.try_get(), Some(true));
}

#[test]
fn system_errors_poison_the_world() {
    init_logger();

    let mut builder = World::builder();
    builder
        .register_system(SystemDef::new(
            "Faulty",
            ScriptSystem::bare(|_| Err(Error::user("system exploded"))),
        ))
        .unwrap();
    let mut world = builder.build().unwrap();

    let err = world.execute().unwrap_err();
    assert_eq!(err.to_string(), "system exploded");

    // only terminate remains legal
    assert!(matches!(
        world.execute(),
        Err(Error::Check(CheckError::WrongState { .. }))
    ));
    world.terminate().unwrap();
    assert!(matches!(
        world.terminate(),
        Err(Error::Check(CheckError::WrongState { .. }))
    ));
}

#[test]
fn entitlements_gate_component_access() {
    init_logger();

    let mut builder = World::builder();
    let secret = builder
        .register_component(ComponentDef::new("Secret").field_default("v", FieldKind::U8))
        .unwrap();

    let entity_slot: Shared<crate::entity::Entity> = Shared::default();
    let entity_captured = entity_slot.clone();
    let outcome: Shared<bool> = Shared::default();
    let outcome_captured = outcome.clone();

    builder
        .register_system(SystemDef::new(
            "Snoop",
            ScriptSystem::bare(move |cx| {
                let entity = entity_captured.get();
                let read_rejected =
                    matches!(cx.read(entity, secret), Err(Error::Check(CheckError::NotEntitled { .. })));
                let write = cx.write(entity, secret);
                outcome_captured.set(
                    read_rejected
                        && matches!(write, Err(Error::Check(CheckError::NotEntitled { .. }))),
                );
                Ok(())
            }),
        ))
        .unwrap();

    let mut world = builder.build().unwrap();
    let entity = world.create_entity(&[(secret, &[])]).unwrap();
    entity_slot.set(entity);

    world.execute().unwrap();
    assert!(outcome.get(), "undeclared access is denied");
}
