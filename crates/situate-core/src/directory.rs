//! The rendezvous directory: a registry of processes keyed by name.
//!
//! Both the rendezvous server and each client hold a replica. Mutations
//! queue a [`RendezvousEvent`]; the owner drains them with
//! [`Rendezvous::take_events`] and forwards them to whoever listens.

use crate::Process;
use std::collections::VecDeque;

/// Change notification raised by a directory mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RendezvousEvent {
    ProcessAdded(Process),
    ProcessRemoved(Process),
}

/// Ordered set of processes with unique names.
#[derive(Debug, Default, Clone)]
pub struct Rendezvous {
    processes: Vec<Process>,
    events: VecDeque<RendezvousEvent>,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processes(&self) -> &[Process] {
        &self.processes
    }

    pub fn get(&self, name: &str) -> Option<&Process> {
        self.processes.iter().find(|p| p.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Add a process unless one with the same name is registered.
    ///
    /// Returns `false` and leaves the directory untouched on a duplicate;
    /// callers replacing a stale entry must remove it first.
    pub fn try_add_process(&mut self, process: Process) -> bool {
        if self.contains(&process.name) {
            return false;
        }
        self.events
            .push_back(RendezvousEvent::ProcessAdded(process.clone()));
        self.processes.push(process);
        true
    }

    /// Remove a process by name. Absent names are a no-op.
    pub fn try_remove_process(&mut self, name: &str) -> bool {
        let Some(index) = self.processes.iter().position(|p| p.name == name) else {
            return false;
        };
        let removed = self.processes.remove(index);
        self.events
            .push_back(RendezvousEvent::ProcessRemoved(removed));
        true
    }

    /// Drain queued change notifications in the order they happened.
    pub fn take_events(&mut self) -> Vec<RendezvousEvent> {
        self.events.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_absent_is_noop() {
        let mut dir = Rendezvous::new();
        assert!(!dir.try_remove_process("ghost"));
        assert!(!dir.try_remove_process("ghost"));
        assert!(dir.processes().is_empty());
        assert!(dir.take_events().is_empty());

        dir.try_add_process(Process::new("a", "1"));
        dir.take_events();
        assert!(!dir.try_remove_process("b"));
        assert_eq!(dir.processes().len(), 1);
        assert!(dir.take_events().is_empty());
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut dir = Rendezvous::new();
        assert!(dir.try_add_process(Process::new("a", "1")));
        assert!(!dir.try_add_process(Process::new("a", "2")));
        assert_eq!(dir.get("a").unwrap().version, "1");
        assert_eq!(dir.take_events().len(), 1);
    }

    #[test]
    fn readd_after_remove() {
        let mut dir = Rendezvous::new();
        dir.try_add_process(Process::new("a", "1"));
        assert!(dir.try_remove_process("a"));
        assert!(dir.try_add_process(Process::new("a", "2")));
        assert_eq!(dir.get("a").unwrap().version, "2");

        let events = dir.take_events();
        assert!(matches!(&events[0], RendezvousEvent::ProcessAdded(p) if p.version == "1"));
        assert!(matches!(&events[1], RendezvousEvent::ProcessRemoved(p) if p.name == "a"));
        assert!(matches!(&events[2], RendezvousEvent::ProcessAdded(p) if p.version == "2"));
    }

    #[test]
    fn preserves_insertion_order() {
        let mut dir = Rendezvous::new();
        for name in ["c", "a", "b"] {
            dir.try_add_process(Process::new(name, "1"));
        }
        let names: Vec<_> = dir.processes().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["c", "a", "b"]);
    }
}
