pub mod admin;
pub mod captcha;
pub mod health;
