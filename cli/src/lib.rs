//! Ferry CLI - run Docker CLI commands against a ferry server in Kubernetes.
//!
//! `ferry run` finds the server pod, port-forwards to it, puts the chunking
//! proxy in front of the tunnel and runs the wrapped command with
//! `DOCKER_HOST` pointing at the proxy.

pub mod commands;
pub mod kube_context;
pub mod proxy;
pub mod tunnel;
