//! Process-wide registry replacement. A single test; the global is shared
//! state within the test binary.

use std::sync::Arc;

use strata_lazy::{current, install, Lazy, LazyRegistry};

#[test]
fn install_migrates_live_handles_and_returns_the_predecessor() {
    let original = current();
    let handle = Lazy::<String>::with_parts(Some(Arc::new("global".to_string())), 424_242, None);

    let replacement = LazyRegistry::default();
    let previous = install(replacement.clone());
    assert!(previous.ptr_eq(&original));
    assert!(current().ptr_eq(&replacement));

    // The handle followed the replacement.
    let mut found = false;
    current().iterate(|lazy| found |= lazy.object_id() == 424_242);
    assert!(found);

    // Restore the original so nothing else in this binary is affected.
    let swapped = install(previous);
    assert!(swapped.ptr_eq(&replacement));
    drop(handle);
}
