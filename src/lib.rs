pub mod configuration;

pub mod flow {
    pub mod extinctionsystem;
    pub mod extinctionprobabilities;
    pub mod flowsystem;
    pub mod flow;
    pub mod flowcache;
}

pub mod likelihood {
    pub mod conditioning;
    pub mod nodelikelihood;
    pub mod birthdeathmigrationdistribution;
    pub mod directintegration;
}

pub mod likelihooderror;

pub mod math {
    pub mod curve {
        pub mod curve;
    }
    pub mod ode {
        pub mod odesystem;
        pub mod continuousoutput;
        pub mod dormandprince;
        pub mod intervalintegrator;
    }
    pub mod rescale;
    pub mod special;
}

pub mod parameterization {
    pub mod parameterization;
    pub mod skylineparameter;
    pub mod canonicalparameterization;
}

pub mod tree {
    pub mod tree;
    pub mod newickparser;
}
