use std::env;

/// launcher variables carrying the rank of this process (Open MPI, MPICH/Hydra, Slurm)
pub const RANK_VARIABLES: [&str; 3] = ["OMPI_COMM_WORLD_RANK", "PMI_RANK", "SLURM_PROCID"];
/// launcher variables carrying the number of processes
pub const SIZE_VARIABLES: [&str; 3] = ["OMPI_COMM_WORLD_SIZE", "PMI_SIZE", "SLURM_NTASKS"];

/// the items at positions `rank, rank + nodes, rank + 2 * nodes, ...`
pub fn round_robin<T>(items: Vec<T>, rank: usize, nodes: usize) -> Vec<T> {
    items.into_iter().skip(rank).step_by(nodes.max(1)).collect()
}

/// first of `variables` that is set and parses
pub fn env_usize(variables: &[&str]) -> Option<usize> {
    variables
        .iter()
        .find_map(|name| env::var(name).ok().and_then(|value| value.trim().parse().ok()))
}
