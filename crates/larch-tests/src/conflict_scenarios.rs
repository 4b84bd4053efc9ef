//! Conflict scenarios driven through a live topology: every member must
//! settle on the same tree without coordination.
