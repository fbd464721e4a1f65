mod client;

pub use client::{
    ApiErrorClass, BotClient, BotError, BotUser, Document, Message, RemoteFile,
    TELEGRAM_API_URL,
};
