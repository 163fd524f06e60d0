// Runnable on the host: cargo run --example usage

use std::sync::Arc;

use minisched_cortex_m::*;

fn main()
{
    let k = Kernel::new(HostArch::new(SimConfig::default().with_tick(1_000)), Config::default()).into_static();

    let q = Arc::new(MsgQueue::<u32>::new(k, "samples", 4));
    let stop = Arc::new(CondVar::new(k, "stop"));

    let snd = q.clone();
    k.create(move |k| task0(k, &snd), 256, "sampler", TaskFlags::empty(), 2);

    let (rcv, st) = (q.clone(), stop.clone());
    k.create(move |k| task1(k, &rcv, &st), 512, "reporter", TaskFlags::empty(), 1);

    k.create_shell(move |k| task2(k, &stop), "monitor");

    let exit = k.run();
    println!("halted at {} us: {:?}", exit.now_us, exit.reason);
}

fn task0(k: &'static Kernel<HostArch>, snd: &MsgQueue<u32>)
{
    for some_value in 0..10 {
        k.sleep_for(10_000);
        k.arch().busy(300);

        snd.send(k, some_value);
    }
}

fn task1(k: &'static Kernel<HostArch>, rcv: &MsgQueue<u32>, stop: &CondVar)
{
    let mut sum = 0;

    loop {
        let conds = [PollCond::Readable(rcv), PollCond::Cond(stop)];

        match k.poll(&conds, None, Some(k.now_us() + 50_000)) {
            Some(0) => {
                while let Some(some_value) = rcv.try_receive(k) {
                    sum += some_value;
                }
            }
            Some(_) => break,
            None => println!("{:>8} us: no samples", k.now_us())
        }
    }

    println!("{:>8} us: sum {}", k.now_us(), sum);
}

fn task2(k: &'static Kernel<HostArch>, stop: &CondVar)
{
    k.sleep_for(150_000);

    println!(" NAME             STACK PRI S   SWPRD    LOAD WCHAN");
    for t in k.tasks() {
        println!("{}", t);
    }

    stop.signal(k);
}
