mod accounts;
mod health;
