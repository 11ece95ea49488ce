use log::{debug, info, warn};
use port_blocker_common::{BLOCKED_PORT_MAP, PortValue};

use crate::{
    attach::select_filtering_program,
    config::Config,
    error::Result,
    kernel::{Collection, Kernel},
    table::{pin_table, set_filtered_port},
};

/// How a `configure` call reached the control table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// An earlier invocation's pinned table was updated in place.
    Reused,
    /// The image was loaded and attached by this invocation.
    Bootstrapped { pinned: bool },
}

/// A program attached by this process, with the table it reads.
///
/// Must be released through [`Attached::release`], which undoes the
/// acquisitions in reverse order.
pub struct Attached<C: Collection> {
    collection: C,
    table: C::Table,
    link: C::Link,
    program: String,
    pinned: bool,
}

impl<C: Collection> Attached<C> {
    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn pinned(&self) -> bool {
        self.pinned
    }

    /// Detach, then close the table handle, then close the collection.
    ///
    /// Every step runs even if an earlier one failed; the first failure is
    /// returned.
    pub fn release(self) -> Result<()> {
        let Attached {
            mut collection,
            table,
            link,
            program,
            ..
        } = self;

        let detached = collection.detach(&program, link);
        match &detached {
            Ok(()) => debug!("detached {program}"),
            Err(err) => warn!("{}", err.report()),
        }
        drop(table);
        collection.close();
        detached
    }
}

/// Point the filter at `port`, reusing a pinned table when there is one.
pub fn configure<K: Kernel>(kernel: &mut K, cfg: &Config, port: PortValue) -> Result<Outcome> {
    match kernel.open_pinned_table(BLOCKED_PORT_MAP, &cfg.pin_path) {
        Ok(mut table) => {
            set_filtered_port(&mut table, port)?;
            info!(
                "updated pinned table {} to block port {port}",
                cfg.pin_path.display()
            );
            return Ok(Outcome::Reused);
        }
        Err(err) => info!(
            "{}; loading {}",
            err.report(),
            cfg.object_path.display()
        ),
    }

    let attached = bootstrap(kernel, cfg, port)?;
    let pinned = attached.pinned();
    info!(
        "blocking port {port} with {} on {}; the program is detached when this process exits",
        attached.program(),
        cfg.interface
    );
    attached.release()?;
    Ok(Outcome::Bootstrapped { pinned })
}

/// Load, attach and configure a fresh program instance.
///
/// Acquisition order is relax limits, parse, realize, attach, write, pin. A
/// failure after attach releases what was acquired before returning.
pub fn bootstrap<K: Kernel>(
    kernel: &mut K,
    cfg: &Config,
    port: PortValue,
) -> Result<Attached<K::Collection>> {
    kernel.relax_memlock()?;

    let mut collection = {
        let spec = kernel.parse_image(&cfg.object_path)?;
        spec.require_table(BLOCKED_PORT_MAP)?;
        let collection = kernel.realize(&spec)?;
        info!(
            "loaded {} ({} programs, {} tables)",
            spec.path().display(),
            spec.programs().len(),
            spec.tables().len()
        );
        collection
    };

    let (program, table) = match select_and_take(&mut collection, cfg) {
        Ok(selected) => selected,
        Err(err) => {
            collection.close();
            return Err(err);
        }
    };
    let link = match collection.attach(&program, &cfg.interface, cfg.xdp_mode) {
        Ok(link) => link,
        Err(err) => {
            drop(table);
            collection.close();
            return Err(err);
        }
    };
    info!("attached {program} to {}", cfg.interface);

    let mut attached = Attached {
        collection,
        table,
        link,
        program,
        pinned: false,
    };

    if let Err(err) = set_filtered_port(&mut attached.table, port) {
        if let Err(release_err) = attached.release() {
            warn!("while unwinding: {}", release_err.report());
        }
        return Err(err);
    }

    attached.pinned = pin_table(&mut attached.table, &cfg.pin_path);
    Ok(attached)
}

fn select_and_take<C: Collection>(collection: &mut C, cfg: &Config) -> Result<(String, C::Table)> {
    let programs = collection.programs();
    let program = select_filtering_program(&programs, cfg.program.as_deref(), cfg.selection)?;
    let table = collection.take_table(BLOCKED_PORT_MAP)?;
    Ok((program.name.clone(), table))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::{
        config::SelectionPolicy,
        error::{Error, ResourceKind},
        kernel::fake::FakeKernel,
        loader::{ProgramDef, ProgramKind},
    };

    fn config() -> Config {
        Config::default()
    }

    #[test]
    fn pinned_table_is_reused_without_bootstrapping() {
        let mut kernel = FakeKernel::default();
        kernel.prepin("/sys/fs/bpf/blocked_port_map", Some(22));

        let outcome = configure(&mut kernel, &config(), 8080).unwrap();

        assert_eq!(outcome, Outcome::Reused);
        assert_eq!(kernel.pinned_port(), Some(8080));
        let events = kernel.events();
        assert_eq!(events[0], "open_pinned");
        for step in ["relax", "parse", "realize"] {
            assert!(!events.iter().any(|e| e == step), "{step} ran: {events:?}");
        }
        assert!(!events.iter().any(|e| e.starts_with("attach")));
    }

    #[test]
    fn missing_pin_falls_back_to_bootstrap_in_order() {
        let mut kernel = FakeKernel::default();

        let outcome = configure(&mut kernel, &config(), 8080).unwrap();

        assert_eq!(outcome, Outcome::Bootstrapped { pinned: true });
        assert_eq!(
            kernel.events(),
            [
                "open_pinned",
                "relax",
                "parse",
                "realize",
                "take_table blocked_port_map",
                "attach xdp_drop lo",
                "write 8080",
                "pin",
                "detach xdp_drop",
                "close_table blocked_port_map",
                "close_collection",
            ]
        );
        assert_eq!(
            kernel.pinned_path(),
            Some(PathBuf::from("/sys/fs/bpf/blocked_port_map"))
        );
        assert_eq!(kernel.pinned_port(), Some(8080));
    }

    #[test]
    fn second_invocation_reuses_the_first_ones_pin() {
        let mut kernel = FakeKernel::default();

        configure(&mut kernel, &config(), 8080).unwrap();
        let outcome = configure(&mut kernel, &config(), 9090).unwrap();

        assert_eq!(outcome, Outcome::Reused);
        assert_eq!(kernel.pinned_port(), Some(9090));
        assert_eq!(
            kernel.events().iter().filter(|e| *e == "realize").count(),
            1
        );
    }

    #[test]
    fn pin_failure_still_succeeds() {
        let mut kernel = FakeKernel::default();
        kernel.fail_pins();

        let outcome = configure(&mut kernel, &config(), 8080).unwrap();

        assert_eq!(outcome, Outcome::Bootstrapped { pinned: false });
        assert!(kernel.events().iter().any(|e| e == "write 8080"));
    }

    #[test]
    fn bootstrap_attaches_exactly_once() {
        let mut kernel = FakeKernel::default();
        kernel.set_image(
            vec![
                ProgramDef::new("tc_mark", ProgramKind::SchedClassifier),
                ProgramDef::new("xdp_a", ProgramKind::Xdp),
                ProgramDef::new("xdp_b", ProgramKind::Xdp),
            ],
            vec![BLOCKED_PORT_MAP.to_string()],
        );

        let attached = bootstrap(&mut kernel, &config(), 443).unwrap();

        assert_eq!(attached.program(), "xdp_b");
        let attaches: Vec<_> = kernel
            .events()
            .into_iter()
            .filter(|e| e.starts_with("attach"))
            .collect();
        assert_eq!(attaches, ["attach xdp_b lo"]);
        attached.release().unwrap();
    }

    #[test]
    fn image_without_xdp_program_fails_before_attach() {
        let mut kernel = FakeKernel::default();
        kernel.set_image(
            vec![ProgramDef::new("tc_mark", ProgramKind::SchedClassifier)],
            vec![BLOCKED_PORT_MAP.to_string()],
        );

        match configure(&mut kernel, &config(), 8080) {
            Err(Error::ResourceNotFound { kind, .. }) => assert_eq!(kind, ResourceKind::Program),
            other => panic!("expected ResourceNotFound, got {other:?}"),
        }
        let events = kernel.events();
        assert!(!events.iter().any(|e| e.starts_with("attach")));
        assert_eq!(events.last().map(String::as_str), Some("close_collection"));
    }

    #[test]
    fn rejected_multiplicity_is_fatal() {
        let mut kernel = FakeKernel::default();
        kernel.set_image(
            vec![
                ProgramDef::new("xdp_a", ProgramKind::Xdp),
                ProgramDef::new("xdp_b", ProgramKind::Xdp),
            ],
            vec![BLOCKED_PORT_MAP.to_string()],
        );
        let cfg = Config {
            selection: SelectionPolicy::Reject,
            ..config()
        };

        assert!(matches!(
            configure(&mut kernel, &cfg, 8080),
            Err(Error::Selection(_))
        ));
    }

    #[test]
    fn image_without_control_table_is_not_realized() {
        let mut kernel = FakeKernel::default();
        kernel.set_image(vec![ProgramDef::new("xdp_drop", ProgramKind::Xdp)], vec![]);

        match configure(&mut kernel, &config(), 8080) {
            Err(Error::ResourceNotFound { kind, name }) => {
                assert_eq!(kind, ResourceKind::Table);
                assert_eq!(name, BLOCKED_PORT_MAP);
            }
            other => panic!("expected ResourceNotFound, got {other:?}"),
        }
        assert!(!kernel.events().iter().any(|e| e == "realize"));
    }

    #[test]
    fn missing_image_is_fatal_with_no_further_fallback() {
        let mut kernel = FakeKernel::default();
        kernel.remove_image();

        let err = configure(&mut kernel, &config(), 8080).unwrap_err();

        assert!(matches!(err, Error::ImageNotFound { .. }));
        assert_eq!(kernel.events(), ["open_pinned", "relax", "parse"]);
    }

    #[test]
    fn privilege_failure_stops_before_loading() {
        let mut kernel = FakeKernel::default();
        kernel.fail_relax();

        assert!(matches!(
            configure(&mut kernel, &config(), 8080),
            Err(Error::Privilege(_))
        ));
        assert_eq!(kernel.events(), ["open_pinned", "relax"]);
    }

    #[test]
    fn failed_write_after_attach_detaches() {
        let mut kernel = FakeKernel::default();
        kernel.fail_writes();

        let err = configure(&mut kernel, &config(), 8080).unwrap_err();

        assert!(matches!(err, Error::Write { port: 8080, .. }));
        let events = kernel.events();
        let tail = &events[events.len() - 4..];
        assert_eq!(
            tail,
            [
                "write 8080",
                "detach xdp_drop",
                "close_table blocked_port_map",
                "close_collection"
            ]
        );
        assert!(!events.iter().any(|e| e == "pin"));
    }

    #[test]
    fn failed_attach_closes_the_collection() {
        let mut kernel = FakeKernel::default();
        kernel.fail_attach();

        let err = configure(&mut kernel, &config(), 8080).unwrap_err();

        assert!(matches!(err, Error::Attach { .. }));
        assert_eq!(
            err.report(),
            "failed to attach xdp_drop to lo: the program was already attached"
        );
        let events = kernel.events();
        assert_eq!(events.last().map(String::as_str), Some("close_collection"));
        assert!(!events.iter().any(|e| e.starts_with("write")));
    }

    #[test]
    fn write_failure_on_reused_table_does_not_bootstrap() {
        let mut kernel = FakeKernel::default();
        kernel.prepin("/sys/fs/bpf/blocked_port_map", None);
        kernel.fail_writes();

        assert!(matches!(
            configure(&mut kernel, &config(), 8080),
            Err(Error::Write { .. })
        ));
        assert!(!kernel.events().iter().any(|e| e == "realize"));
    }
}
