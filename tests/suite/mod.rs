mod debugging;
mod discovery;
mod endpoint;
mod running;
