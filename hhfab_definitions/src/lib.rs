#![recursion_limit = "1024"]
#![allow(renamed_and_removed_lints)]
#![allow(non_snake_case)]

#[macro_use]
extern crate serde_derive;
extern crate serde_yaml;
extern crate serde_json;
extern crate serde;

#[macro_use]
extern crate log;

extern crate regex;
extern crate ipnetwork;
extern crate walkdir;

#[macro_use]
extern crate error_chain;
error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }
    links {}
    foreign_links {
        Fmt(::std::fmt::Error);
        Io(::std::io::Error) #[cfg(unix)];
        Int(::std::num::ParseIntError);
        Addr(::std::net::AddrParseError);
        Net(ipnetwork::IpNetworkError);
        SerdeY(serde_yaml::Error);
        SerdeJ(serde_json::Error);
    }
    errors {
        InvalidWiring(entity: String, reason: String) {
            description("wiring violates an invariant")
            display("{}: {}", &entity, &reason)
        }
        HydrationFailure(reason: String) {
            description("wiring could not be hydrated")
            display("hydration failed: {}", &reason)
        }
        PortsExhausted(switch: String) {
            description("switch has no free ports left")
            display("no free ports left on {}", &switch)
        }
        UnknownObject(kind: String, name: String) {
            description("named object not found in the wiring")
            display("no {} named '{}' in the wiring", &kind, &name)
        }
        DuplicateObject(kind: String, name: String) {
            description("named object already exists in the wiring")
            display("{} '{}' already exists in the wiring", &kind, &name)
        }
    }
}

/// Fabricator configuration from fab.yaml
pub mod config;
pub use crate::config::{BuildMode, FabConfig, FabricMode, RegistryConfig};

/// Deterministic identifier and port allocation
pub mod ports;
pub use crate::ports::PortAllocator;

/// Wiring entities and the in-memory object store
pub mod wiring;
pub use crate::wiring::{Connection, ControlNode, FabNode, Gateway, Server, Switch, Wiring};

/// Crd wrappers for the wiring YAML stream
mod crds;
pub use crate::crds::Crd;

/// Topology synthesis from high-level knobs
pub mod builder;
pub use crate::builder::BuildOpts;

/// Hydration status detection, allocation and validation
pub mod hydrate;
pub use crate::hydrate::{HydrateMode, HydrationStatus};

/// VM plan derived from a frozen wiring
pub mod vlab;
pub use crate::vlab::{Nic, Vm, VmSize, VmType, VlabPlan};
