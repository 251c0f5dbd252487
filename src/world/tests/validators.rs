//! Validator dispatch on shape changes.

use crate::comp::ComponentDef;
use crate::error::{CheckError, Error};
use crate::test_util::{init_logger, Shared};
use crate::world::World;

#[test]
fn validator_rejects_creation_on_shape() {
    init_logger();

    let mut builder = World::builder();
    let b = builder.register_component(ComponentDef::new("B")).unwrap();
    let c = builder.register_component(ComponentDef::new("C")).unwrap();

    // A requires exactly one of B and C while present
    let a_id = Shared::default();
    let a_captured = a_id.clone();
    let a = builder
        .register_component(ComponentDef::new("A").validate(move |entity| {
            if !entity.has(a_captured.get()) {
                return Ok(());
            }
            match entity.count_has(&[b, c]) {
                0 => Err(Error::user("A missing B or C")),
                2 => Err(Error::user("A has both B and C")),
                _ => Ok(()),
            }
        }))
        .unwrap();
    a_id.set(a);
    let _d = builder.register_component(ComponentDef::new("D")).unwrap();

    let mut world = builder.build().unwrap();
    let baseline = world.live_entities();

    let err = world.create_entity(&[(a, &[])]).unwrap_err();
    assert_eq!(err.to_string(), "A missing B or C");

    let err = world.create_entity(&[(a, &[]), (b, &[]), (c, &[])]).unwrap_err();
    assert_eq!(err.to_string(), "A has both B and C");

    let entity = world.create_entity(&[(a, &[]), (b, &[])]).unwrap();
    assert!(world.has(entity, a).unwrap());

    // rejected entities never became visible
    assert_eq!(world.live_entities(), baseline + 1);
}

#[test]
fn validator_cannot_read_components() {
    init_logger();

    let mut builder = World::builder();
    let e_id: Shared<crate::comp::ComponentId> = Shared::default();
    let e_captured = e_id.clone();
    let e = builder
        .register_component(ComponentDef::new("E").validate(move |entity| {
            entity.read(e_captured.get())?;
            Ok(())
        }))
        .unwrap();
    e_id.set(e);

    let mut world = builder.build().unwrap();
    let err = world.create_entity(&[(e, &[])]).unwrap_err();
    assert!(
        matches!(err, Error::Check(CheckError::NotEntitled { ref accessor, .. }) if accessor == "validator"),
        "unexpected error: {err}",
    );
    assert_eq!(world.live_entities(), 0);
}

#[test]
fn failed_remove_leaves_shape_intact() {
    init_logger();

    let mut builder = World::builder();
    let anchor = builder.register_component(ComponentDef::new("Anchor")).unwrap();
    let tag_id = Shared::default();
    let tag_captured = tag_id.clone();
    let tag = builder
        .register_component(ComponentDef::new("Tag").validate(move |entity| {
            // Tag may only exist alongside Anchor
            if entity.has(tag_captured.get()) && !entity.has(anchor) {
                Err(Error::user("Tag without Anchor"))
            } else {
                Ok(())
            }
        }))
        .unwrap();
    tag_id.set(tag);

    let mut world = builder.build().unwrap();
    let entity = world.create_entity(&[(anchor, &[]), (tag, &[])]).unwrap();

    // removing Anchor would leave Tag orphaned; the mutation unwinds
    let err = world.remove(entity, anchor).unwrap_err();
    assert_eq!(err.to_string(), "Tag without Anchor");
    assert!(world.has(entity, anchor).unwrap());
    assert!(world.has(entity, tag).unwrap());
}

#[test]
fn build_block_rolls_back_every_entity() {
    init_logger();

    let mut builder = World::builder();
    let plain = builder.register_component(ComponentDef::new("Plain")).unwrap();
    let mut world = builder.build().unwrap();

    let err = world
        .build(|world| -> crate::error::Result<()> {
            world.create_entity(&[(plain, &[])])?;
            world.create_entity(&[(plain, &[])])?;
            Err(Error::user("abort the batch"))
        })
        .unwrap_err();
    assert_eq!(err.to_string(), "abort the batch");
    assert_eq!(world.live_entities(), 0);

    // a successful block keeps its entities
    world
        .build(|world| {
            world.create_entity(&[(plain, &[])])?;
            Ok(())
        })
        .unwrap();
    assert_eq!(world.live_entities(), 1);
}
