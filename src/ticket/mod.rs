//! Ticket Store: the `Ticket` type plus identity resolution, listing, and
//! atomic directory moves across `todo/`, `doing/`, `done/`.

mod model;
mod store;

pub use model::{
    generate_id, is_valid_id, parse_document, render_document, validate_slug, Frontmatter,
    Status, Ticket,
};
pub use store::{ListFilter, TicketStore};
