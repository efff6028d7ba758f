pub mod account;
pub mod session;
pub mod user;

pub use account::Entity as Account;
pub use session::Entity as Session;
pub use user::Entity as User;
