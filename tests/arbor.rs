#[path = "arbor/support.rs"]
mod support;

#[path = "arbor/lifecycle.rs"]
mod lifecycle;
#[path = "arbor/properties.rs"]
mod properties;
#[path = "arbor/restore.rs"]
mod restore;
#[path = "arbor/tree.rs"]
mod tree;
