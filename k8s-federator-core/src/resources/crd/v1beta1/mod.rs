pub mod kubefedcluster;
