pub mod vmq;
