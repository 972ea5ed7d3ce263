use std::sync::Arc;

use tokio::sync::watch;

use crate::ddms::{ApnmChunk, HeloChunk};

/// Names a VM reports before it knows its real process name.
pub const EARLY_PROCESS_NAMES: &[&str] = &["", "<pre-initialized>"];

/// Drops placeholder names so they never surface as real values.
pub fn filter_early_name(name: Option<String>) -> Option<String> {
    name.filter(|name| !EARLY_PROCESS_NAMES.contains(&name.as_str()))
}

/// Snapshot of what is known about one process.
///
/// Updates produce a new snapshot through the `with_*` methods. A field that
/// is set never goes back to unset; only `is_waiting_for_debugger` toggles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessProperties {
    pub pid: u32,
    pub process_name: Option<String>,
    pub user_id: Option<i32>,
    pub package_name: Option<String>,
    pub vm_identifier: Option<String>,
    pub abi: Option<String>,
    pub jvm_flags: Option<String>,
    pub is_native_debuggable: bool,
    pub is_waiting_for_debugger: bool,
    pub features: Vec<String>,
    pub reaq_enabled: bool,
    pub last_error: Option<String>,
}

impl ProcessProperties {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            process_name: None,
            user_id: None,
            package_name: None,
            vm_identifier: None,
            abi: None,
            jvm_flags: None,
            is_native_debuggable: false,
            is_waiting_for_debugger: false,
            features: Vec::new(),
            reaq_enabled: false,
            last_error: None,
        }
    }

    pub fn with_helo(mut self, helo: &HeloChunk) -> Self {
        if helo.pid != 0 && helo.pid != self.pid {
            tracing::debug!(
                target: "ddmux.process",
                pid = self.pid,
                reported = helo.pid,
                "HELO reply reports a different pid"
            );
        }
        merge(
            &mut self.process_name,
            filter_early_name(Some(helo.process_name.clone())),
        );
        merge(&mut self.user_id, helo.user_id);
        merge(
            &mut self.package_name,
            filter_early_name(helo.package_name.clone()),
        );
        merge(
            &mut self.vm_identifier,
            Some(helo.vm_identifier.clone()).filter(|s| !s.is_empty()),
        );
        merge(&mut self.abi, helo.abi.clone().filter(|s| !s.is_empty()));
        merge(&mut self.jvm_flags, helo.jvm_flags.clone());
        if let Some(debuggable) = helo.is_native_debuggable {
            self.is_native_debuggable = debuggable;
        }
        self
    }

    pub fn with_apnm(mut self, apnm: &ApnmChunk) -> Self {
        merge(
            &mut self.process_name,
            filter_early_name(Some(apnm.process_name.clone())),
        );
        merge(&mut self.user_id, apnm.user_id);
        merge(
            &mut self.package_name,
            filter_early_name(apnm.package_name.clone()),
        );
        self
    }

    /// An empty list keeps the features already known.
    pub fn with_features(mut self, features: Vec<String>) -> Self {
        if !features.is_empty() {
            self.features = features;
        }
        self
    }

    pub fn with_reaq_enabled(mut self, enabled: bool) -> Self {
        self.reaq_enabled = enabled;
        self
    }

    pub fn with_waiting_for_debugger(mut self, waiting: bool) -> Self {
        self.is_waiting_for_debugger = waiting;
        self
    }

    pub fn with_last_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }
}

fn merge<T>(slot: &mut Option<T>, fresh: Option<T>) {
    if fresh.is_some() {
        *slot = fresh;
    }
}

/// Latest [`ProcessProperties`] of one process, observable through
/// [`watch`] receivers. Clones share the same cell.
#[derive(Clone, Debug)]
pub struct ProcessPropertiesCell {
    tx: Arc<watch::Sender<ProcessProperties>>,
}

impl ProcessPropertiesCell {
    pub fn new(pid: u32) -> Self {
        let (tx, _rx) = watch::channel(ProcessProperties::new(pid));
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> ProcessProperties {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessProperties> {
        self.tx.subscribe()
    }

    /// Replaces the snapshot with `f(current)`. Subscribers are only woken
    /// when the result differs; returns whether it did.
    pub fn update(&self, f: impl FnOnce(ProcessProperties) -> ProcessProperties) -> bool {
        self.tx.send_if_modified(|current| {
            let next = f(current.clone());
            if next == *current {
                return false;
            }
            *current = next;
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn helo(process_name: &str, package_name: Option<&str>) -> HeloChunk {
        HeloChunk {
            protocol_version: 1,
            pid: 42,
            vm_identifier: "ART".to_string(),
            process_name: process_name.to_string(),
            user_id: Some(10),
            abi: Some("arm64-v8a".to_string()),
            jvm_flags: Some("-Xcheck:jni".to_string()),
            is_native_debuggable: Some(true),
            package_name: package_name.map(str::to_string),
        }
    }

    #[test]
    fn placeholder_names_are_never_surfaced() {
        for early in EARLY_PROCESS_NAMES {
            let props = ProcessProperties::new(42)
                .with_helo(&helo(early, Some(early)))
                .with_apnm(&ApnmChunk {
                    process_name: early.to_string(),
                    user_id: None,
                    package_name: Some(early.to_string()),
                });
            assert_eq!(props.process_name, None, "{early:?}");
            assert_eq!(props.package_name, None, "{early:?}");
        }
    }

    #[test]
    fn placeholder_never_overwrites_a_real_name() {
        let props = ProcessProperties::new(42)
            .with_helo(&helo("com.example.app", Some("com.example")))
            .with_apnm(&ApnmChunk {
                process_name: "<pre-initialized>".to_string(),
                user_id: None,
                package_name: None,
            });
        assert_eq!(props.process_name.as_deref(), Some("com.example.app"));
        assert_eq!(props.package_name.as_deref(), Some("com.example"));
        assert_eq!(props.user_id, Some(10));
    }

    #[test]
    fn partial_updates_only_accumulate() {
        let after_helo = ProcessProperties::new(42).with_helo(&helo("com.example.app", None));
        let after_feat = after_helo
            .clone()
            .with_features(vec!["hprof-heap-dump".to_string()]);
        let after_wait = after_feat.clone().with_waiting_for_debugger(true);

        // Empty data of the same kind keeps what is already known.
        let final_props = after_wait
            .clone()
            .with_features(Vec::new())
            .with_helo(&HeloChunk::default());

        assert_eq!(
            final_props,
            ProcessProperties {
                pid: 42,
                process_name: Some("com.example.app".to_string()),
                user_id: Some(10),
                package_name: None,
                vm_identifier: Some("ART".to_string()),
                abi: Some("arm64-v8a".to_string()),
                jvm_flags: Some("-Xcheck:jni".to_string()),
                is_native_debuggable: true,
                is_waiting_for_debugger: true,
                features: vec!["hprof-heap-dump".to_string()],
                reaq_enabled: false,
                last_error: None,
            }
        );
    }

    #[tokio::test]
    async fn cell_only_notifies_on_change() {
        let cell = ProcessPropertiesCell::new(7);
        let mut rx = cell.subscribe();
        rx.mark_unchanged();

        assert!(!cell.update(|props| props.with_features(Vec::new())));
        assert!(!rx.has_changed().unwrap());

        assert!(cell.update(|props| props.with_reaq_enabled(true)));
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().reaq_enabled);
        assert_eq!(cell.get().pid, 7);
    }
}
