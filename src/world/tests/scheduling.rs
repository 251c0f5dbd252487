//! Plan construction and phase ordering over whole worlds.

use crate::comp::{ComponentDef, FieldKind};
use crate::error::{CheckError, Error};
use crate::system::{Control, SystemDef};
use crate::test_util::{init_logger, EventLog, ScriptSystem};
use crate::world::World;

#[test]
fn writers_run_before_readers_with_explicit_edges() {
    init_logger();

    let mut builder = World::builder();
    let data = builder
        .register_component(ComponentDef::new("Data").field_default("v", FieldKind::U32))
        .unwrap();

    let log = EventLog::default();

    // readers are registered first, so only the edges can order them last
    let log_b = log.clone();
    let b = builder
        .register_system(SystemDef::new(
            "SysB",
            ScriptSystem::new(
                move |decl| {
                    decl.query().reads(&[data]).build();
                },
                move |_| {
                    log_b.push("SysB");
                    Ok(())
                },
            ),
        ))
        .unwrap();
    let log_c = log.clone();
    let c = builder
        .register_system(SystemDef::new(
            "SysC",
            ScriptSystem::new(
                move |decl| {
                    decl.query().reads(&[data]).build();
                },
                move |_| {
                    log_c.push("SysC");
                    Ok(())
                },
            ),
        ))
        .unwrap();
    let log_a = log.clone();
    builder
        .register_system(
            SystemDef::new(
                "SysA",
                ScriptSystem::new(
                    move |decl| {
                        decl.query().writes(&[data]).build();
                    },
                    move |_| {
                        log_a.push("SysA");
                        Ok(())
                    },
                ),
            )
            .before(b)
            .before(c),
        )
        .unwrap();

    let mut world = builder.build().unwrap();
    world.execute().unwrap();

    assert!(log.position("SysA") < log.position("SysB"));
    assert!(log.position("SysA") < log.position("SysC"));
}

#[test]
fn schedule_cycles_fail_the_build() {
    init_logger();

    let mut builder = World::builder();
    let a = builder
        .register_system(SystemDef::new("A", ScriptSystem::bare(|_| Ok(()))))
        .unwrap();
    builder
        .register_system(SystemDef::new("B", ScriptSystem::bare(|_| Ok(()))).after(a).before(a))
        .unwrap();
    let err = builder.build().err().unwrap();
    assert!(matches!(err, Error::Check(CheckError::CycleDetected { .. })));
}

#[test]
fn stopped_systems_skip_execute_until_restarted() {
    init_logger();

    let mut builder = World::builder();
    let log = EventLog::default();
    let log_captured = log.clone();
    let ticker = builder
        .register_system(SystemDef::new(
            "Ticker",
            ScriptSystem::bare(move |_| {
                log_captured.push("tick");
                Ok(())
            }),
        ))
        .unwrap();
    let mut world = builder.build().unwrap();

    world.execute().unwrap();
    assert_eq!(log.take(), vec!["tick"]);

    world.control(Control { stop: vec![ticker], ..Default::default() }).unwrap();
    world.execute().unwrap();
    world.execute().unwrap();
    assert_eq!(log.take(), Vec::<String>::new());

    world.control(Control { restart: vec![ticker], ..Default::default() }).unwrap();
    world.execute().unwrap();
    assert_eq!(log.take(), vec!["tick"]);
}

#[test]
fn custom_executor_runs_chosen_groups() {
    init_logger();

    let mut builder = World::builder();
    let log = EventLog::default();
    let log_zero = log.clone();
    builder
        .register_system(SystemDef::new(
            "Zero",
            ScriptSystem::bare(move |_| {
                log_zero.push("zero");
                Ok(())
            }),
        ))
        .unwrap();
    let log_one = log.clone();
    builder
        .register_system(
            SystemDef::new(
                "One",
                ScriptSystem::bare(move |_| {
                    log_one.push("one");
                    Ok(())
                }),
            )
            .group(1),
        )
        .unwrap();
    let mut world = builder.build().unwrap();

    {
        let mut frame = world.custom_executor(&[0, 1]).unwrap();
        frame.execute(1).unwrap();
        frame.execute(0).unwrap();
        assert!(matches!(
            frame.execute(7),
            Err(Error::Check(CheckError::UnknownId { .. }))
        ));
    }
    assert_eq!(log.take(), vec!["one", "zero"]);

    // a frame over a subset leaves the other group untouched
    {
        let mut frame = world.custom_executor(&[1]).unwrap();
        frame.execute(1).unwrap();
    }
    assert_eq!(log.take(), vec!["one"]);
}

#[test]
fn cross_group_constraints_are_rejected() {
    init_logger();

    let mut builder = World::builder();
    let zero = builder
        .register_system(SystemDef::new("Zero", ScriptSystem::bare(|_| Ok(()))))
        .unwrap();
    builder
        .register_system(SystemDef::new("One", ScriptSystem::bare(|_| Ok(()))).group(1).after(zero))
        .unwrap();
    let err = builder.build().err().unwrap();
    assert!(matches!(err, Error::Check(CheckError::ForeignConstraint { .. })));
}

#[test]
fn duplicate_system_names_are_rejected() {
    init_logger();

    let mut builder = World::builder();
    builder
        .register_system(SystemDef::new("Twin", ScriptSystem::bare(|_| Ok(()))))
        .unwrap();
    let err = builder
        .register_system(SystemDef::new("Twin", ScriptSystem::bare(|_| Ok(()))))
        .unwrap_err();
    assert!(matches!(err, Error::Check(CheckError::DuplicateName { .. })));
}
